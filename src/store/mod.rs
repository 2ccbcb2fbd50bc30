pub mod pool;
pub mod queries;
pub mod writer;

pub use pool::{ensure_schema, open_pool, DbPool};
pub use writer::{WriteBuffer, WriteBufferConfig};

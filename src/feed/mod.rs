pub mod decode;
pub mod manager;

pub use decode::{DataFrame, Frame};
pub use manager::{FeedManager, FrameHandler};

//! Resilient WebSocket feed loop.
//!
//! One `FeedManager` owns one upstream connection: connect, send a single
//! subscribe request for the full channel set, then read frames forever.
//! Reads carry an idle timeout; a silent connection gets one ping, and a
//! second silent period declares it dead. Every failure path falls through to
//! a reconnect with exponential backoff, and every reconnect resends the full
//! channel list, so resubscription is idempotent.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::feed::decode::{decode_frame, DataFrame, Frame};
use crate::types::Channel;

/// Callback seam for decoded data frames. Invocations happen sequentially on
/// the connection task, never concurrently with each other; a returned error
/// is logged and swallowed so the read loop keeps going.
pub trait FrameHandler: Send {
    fn on_frame(&mut self, frame: DataFrame) -> impl Future<Output = Result<()>> + Send;
}

pub struct FeedManager {
    url: String,
    channels: Vec<Channel>,
    idle_timeout: Duration,
    backoff_initial: Duration,
    backoff_cap: Duration,
}

impl FeedManager {
    pub fn new(
        url: impl Into<String>,
        channels: Vec<Channel>,
        idle_timeout: Duration,
        backoff_initial: Duration,
        backoff_cap: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            channels,
            idle_timeout,
            backoff_initial: backoff_initial.max(Duration::from_millis(1)),
            backoff_cap,
        }
    }

    /// The subscribe request sent on every (re)connect.
    pub fn subscribe_payload(&self) -> String {
        json!({"op": "subscribe", "args": self.channels}).to_string()
    }

    /// Run the connection supervisor. Never returns in normal operation; it
    /// ends only via external cancellation of the owning task.
    pub async fn run<H: FrameHandler>(self, handler: &mut H) -> Result<()> {
        // connect_async takes &str; parse up front so a bad URL fails loudly
        // instead of being retried forever.
        let _ = Url::parse(&self.url).context("bad feed url")?;

        let mut backoff = self.backoff_initial;
        let mut attempt: u64 = 0;

        loop {
            attempt = attempt.wrapping_add(1);
            info!(attempt, url = %self.url, "feed connect");

            let ws_stream = match tokio_tungstenite::connect_async(&self.url).await {
                Ok((ws, _resp)) => ws,
                Err(e) => {
                    warn!(attempt, "feed connect failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_cap);
                    continue;
                }
            };

            let (mut w, mut r) = ws_stream.split();

            if let Err(e) = w.send(Message::Text(self.subscribe_payload().into())).await {
                warn!(attempt, "feed subscribe send failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.backoff_cap);
                continue;
            }
            info!(
                attempt,
                channels = self.channels.len(),
                "feed subscribed"
            );

            // Connected and subscribed: reset the backoff ladder.
            backoff = self.backoff_initial;

            let mut awaiting_pong = false;
            loop {
                let msg = match tokio::time::timeout(self.idle_timeout, r.next()).await {
                    Err(_elapsed) => {
                        if awaiting_pong {
                            warn!("feed silent after ping, reconnecting");
                            break;
                        }
                        debug!(
                            "no frame for {:?}, sending ping",
                            self.idle_timeout
                        );
                        if let Err(e) = w.send(Message::Ping(Vec::new().into())).await {
                            warn!("feed ping send failed: {e}");
                            break;
                        }
                        awaiting_pong = true;
                        continue;
                    }
                    Ok(None) => {
                        warn!("feed stream ended, reconnecting");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!("feed read error: {e}");
                        break;
                    }
                    Ok(Some(Ok(m))) => m,
                };

                // Any inbound frame proves the connection is alive.
                awaiting_pong = false;

                match msg {
                    Message::Text(txt) => match decode_frame(&txt) {
                        Ok(Frame::Data(frame)) => {
                            if let Err(e) = handler.on_frame(frame).await {
                                warn!("frame handler failed: {e:#}");
                            }
                        }
                        Ok(Frame::Event(ev)) => {
                            if ev.event == "error" {
                                warn!(
                                    code = ev.code.as_deref().unwrap_or(""),
                                    msg = ev.msg.as_deref().unwrap_or(""),
                                    "feed error event"
                                );
                            } else {
                                debug!(event = %ev.event, "feed event");
                            }
                        }
                        Err(e) => {
                            warn!("dropping undecodable frame: {e:#}");
                        }
                    },
                    Message::Ping(payload) => {
                        let _ = w.send(Message::Pong(payload)).await;
                    }
                    Message::Pong(_) => {}
                    Message::Close(frame) => {
                        warn!("feed closed by server: {frame:?}");
                        break;
                    }
                    _ => {}
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.backoff_cap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_payload_lists_all_channels_in_order() {
        let mgr = FeedManager::new(
            "wss://example.test/ws",
            vec![
                Channel::new("candle1m", "BTC-USDT"),
                Channel::new("candle1m", "ETH-USDT"),
            ],
            Duration::from_secs(25),
            Duration::from_secs(1),
            Duration::from_secs(32),
        );
        let payload: serde_json::Value =
            serde_json::from_str(&mgr.subscribe_payload()).unwrap();
        assert_eq!(payload["op"], "subscribe");
        assert_eq!(payload["args"][0]["channel"], "candle1m");
        assert_eq!(payload["args"][0]["instId"], "BTC-USDT");
        assert_eq!(payload["args"][1]["instId"], "ETH-USDT");
    }

    #[test]
    fn bad_url_is_rejected_up_front() {
        let mgr = FeedManager::new(
            "not a url",
            vec![Channel::new("candle1m", "BTC-USDT")],
            Duration::from_secs(25),
            Duration::from_secs(1),
            Duration::from_secs(32),
        );
        struct Nop;
        impl FrameHandler for Nop {
            async fn on_frame(&mut self, _frame: DataFrame) -> Result<()> {
                Ok(())
            }
        }
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut h = Nop;
        assert!(rt.block_on(mgr.run(&mut h)).is_err());
    }
}

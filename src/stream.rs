// src/stream.rs
// Live update stream: persistent channel delivering log entries as the
// server appends them, with the reconnect-on-abnormal-close policy

use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::server::LogEntry;

/// Close code the server uses for an orderly shutdown; anything else
/// triggers the reconnection policy.
const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug)]
pub enum StreamEvent {
    /// A log entry arrived on the live channel.
    Entry(LogEntry),
    /// The channel came back after an abnormal closure. The ingestor
    /// must refetch the conversation list and bulk-reload each room to
    /// close any gap accrued during the outage.
    Reconnected,
    /// The server closed the channel normally; no reconnect.
    Closed,
}

/// Drive the live stream until the consumer goes away or the server
/// closes normally. Spawned once per subscription; cancelled by
/// aborting the task.
pub async fn run_stream(
    events_url: String,
    reconnect_delay: Duration,
    events: UnboundedSender<StreamEvent>,
) {
    let mut first_connect = true;
    loop {
        match connect_async(events_url.as_str()).await {
            Ok((mut socket, _)) => {
                debug!("[Stream] connected to {}", events_url);
                if !first_connect && events.send(StreamEvent::Reconnected).is_err() {
                    return;
                }
                first_connect = false;

                let mut normal_close = false;
                while let Some(frame) = socket.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<LogEntry>(&text) {
                                Ok(entry) => {
                                    if events.send(StreamEvent::Entry(entry)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("[Stream] undecodable frame: {}", e),
                            }
                        }
                        Ok(WsMessage::Close(frame)) => {
                            let code = frame.map(|f| u16::from(f.code)).unwrap_or(0);
                            debug!("[Stream] closed with code {}", code);
                            normal_close = code == NORMAL_CLOSE;
                            break;
                        }
                        Ok(_) => {} // ping/pong/binary
                        Err(e) => {
                            warn!("[Stream] read error: {}", e);
                            break;
                        }
                    }
                }

                if normal_close {
                    let _ = events.send(StreamEvent::Closed);
                    return;
                }
            }
            Err(e) => warn!("[Stream] connect to {} failed: {}", events_url, e),
        }

        if events.is_closed() {
            return;
        }
        debug!("[Stream] reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
    }
}

//! Client transport abstraction.
//!
//! A [`Room`](crate::client::Room) talks to the relay through a pair of
//! channels; a [`Connector`] produces that pair for a URL. The WebSocket
//! implementation pumps the channels from two tasks, and tests substitute an
//! in-memory connector.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::RoomError;

/// What the receiving side of a transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    /// Non-fatal error; a `Closed` follows if the connection is gone.
    Error(String),
    Closed,
}

/// An open connection.
///
/// Dropping `outgoing` closes the connection.
pub struct Transport {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, RoomError>>;
}

/// `tokio-tungstenite` client connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, RoomError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| RoomError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();

            // Writer task: forward the outgoing channel; close once every
            // sender is gone.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                        log::error!("WebSocket send failed: {e}");
                        return;
                    }
                }
                let _ = ws_writer.send(Message::Close(None)).await;
            });

            // Reader task
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if in_tx.send(TransportEvent::Message(text.to_string())).is_err() {
                                return;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("WebSocket error: {e}");
                            let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
                let _ = in_tx.send(TransportEvent::Closed);
            });

            log::info!("Connected to {url}");
            Ok(Transport {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

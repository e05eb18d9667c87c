//! Streaming transport for exchange sessions
//!
//! A session is a [`Link`]: a bounded outbound frame queue plus an inbound
//! frame receiver. The connection driver never touches a socket directly,
//! so the same driver runs against a real WebSocket ([`WsConnector`]) or a
//! scripted in-memory peer ([`ChannelConnector`]).
//!
//! Outbound sends use `try_send`; a full queue is a rejected send.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Capacity of the inbound frame queue between reader task and driver.
const INBOUND_QUEUE: usize = 1024;

/// Frame queued for the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Protocol-level ping
    Ping,
    /// Protocol-level pong answering a server ping
    Pong(Vec<u8>),
    /// Close the session gracefully
    Close,
}

/// Frame delivered from the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// An open session.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// Opens sessions to a streaming endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, outbound_capacity: usize) -> Result<Link, TransportError>;
}

/// WebSocket connector over tokio-tungstenite.
///
/// Each session runs a writer task draining the outbound queue into the
/// socket and a reader task forwarding socket messages to the inbound
/// queue. When every outbound sender is dropped the writer closes the
/// socket and stops the reader.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, outbound_capacity: usize) -> Result<Link, TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(INBOUND_QUEUE);

        // The reader only holds a weak sender so it never keeps the writer alive.
        let pong_tx = out_tx.downgrade();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => InboundFrame::Text(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => InboundFrame::Text(text),
                        Err(_) => {
                            debug!("ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        if let Some(tx) = pong_tx.upgrade() {
                            let _ = tx.try_send(OutboundFrame::Pong(payload));
                        }
                        continue;
                    }
                    Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                    Ok(Message::Close(close)) => {
                        let (code, reason) = match close {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        let _ = in_tx.send(InboundFrame::Closed { code, reason }).await;
                        break;
                    }
                    Err(e) => {
                        let _ = in_tx.send(InboundFrame::Error(e.to_string())).await;
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame {
                    OutboundFrame::Text(text) => Message::Text(text),
                    OutboundFrame::Ping => Message::Ping(Vec::new()),
                    OutboundFrame::Pong(payload) => Message::Pong(payload),
                    OutboundFrame::Close => break,
                };
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            reader.abort();
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Remote side of a [`ChannelConnector`] session.
#[derive(Debug)]
pub struct RemoteEnd {
    pub url: String,
    /// Frames the engine sent
    pub outbound: mpsc::Receiver<OutboundFrame>,
    /// Feed frames to the engine
    pub inbound: mpsc::Sender<InboundFrame>,
}

/// In-memory connector: every successful connect hands a [`RemoteEnd`]
/// to whoever holds the receiver returned by [`ChannelConnector::new`].
#[derive(Debug)]
pub struct ChannelConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    refusals: AtomicUsize,
    stalls: AtomicUsize,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes: tx,
                refusals: AtomicUsize::new(0),
                stalls: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Make the next `n` connect attempts fail.
    pub fn refuse_next(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connect attempts hang without completing the
    /// handshake.
    pub fn stall_next(&self, n: usize) {
        self.stalls.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, url: &str, outbound_capacity: usize) -> Result<Link, TransportError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "refused".to_string(),
            });
        }
        let stalled = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            return std::future::pending().await;
        }

        let (out_tx, out_rx) = mpsc::channel(outbound_capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        self.remotes
            .send(RemoteEnd {
                url: url.to_string(),
                outbound: out_rx,
                inbound: in_tx,
            })
            .map_err(|_| TransportError::Connect {
                url: url.to_string(),
                reason: "no remote listener".to_string(),
            })?;

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

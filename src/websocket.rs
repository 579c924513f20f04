//! # Backend Transport
//!
//! A WebSocket connection to the live backend, exposed as a pair of channels so
//! the session never touches the socket directly.
//!
//! ## Channels:
//! - **outbound**: [`ClientMessage`]s, serialized to JSON text frames by a writer task
//! - **inbound**: [`TransportEvent`]s produced by a reader task
//!
//! ## Lifecycle:
//! 1. [`connect`] completes the handshake and queues [`TransportEvent::Opened`]
//! 2. Every text (or UTF-8 binary) frame is parsed into a [`ServerMessage`]
//! 3. A close frame, a socket error or the end of the stream ends the reader with
//!    exactly one `Closed` or `Error` event
//! 4. Dropping every outbound sender closes the socket

use crate::error::AppResult;
use crate::protocol::{ClientMessage, ServerMessage};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Something that happened on the connection.
#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Message(Box<ServerMessage>),
    /// Connection failed mid-stream; nothing more will arrive
    Error(String),
    /// The backend closed the connection
    Closed { reason: String },
}

/// A live connection as seen by the session.
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The far end of an in-memory [`Transport`]: what a backend would see.
pub struct TransportPeer {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub sent: mpsc::UnboundedReceiver<ClientMessage>,
}

impl Transport {
    /// A transport wired to an in-process peer instead of a socket.
    pub fn in_memory() -> (Transport, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outbound: out_tx,
                inbound: in_rx,
            },
            TransportPeer {
                events: in_tx,
                sent: out_rx,
            },
        )
    }
}

/// Opens transports. The session asks for one each time it is opened.
pub trait Connector: Send + Sync {
    fn connect(&self, url: String) -> BoxFuture<'static, AppResult<Transport>>;
}

/// Connects over `wss://` with tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, AppResult<Transport>> {
        async move { connect(&url).await }.boxed()
    }
}

/// Strip the API key before a URL goes into a log line.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Open a WebSocket connection and spawn its reader and writer tasks.
pub async fn connect(url: &str) -> AppResult<Transport> {
    info!(endpoint = redact(url), "Connecting to live backend");
    let (socket, _response) = tokio_tungstenite::connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
    let _ = in_tx.send(TransportEvent::Opened);

    // Writer: session → socket
    let writer_events = in_tx.clone();
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Dropping unserializable outbound message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!(error = %e, "WebSocket send failed");
                let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                return;
            }
        }
        debug!("Outbound channel closed, closing WebSocket");
        let _ = sink.close().await;
    });

    // Reader: socket → session
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    info!(reason = %reason, "Backend closed the connection");
                    let _ = in_tx.send(TransportEvent::Closed { reason });
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "WebSocket receive failed");
                    let _ = in_tx.send(TransportEvent::Error(e.to_string()));
                    return;
                }
            };

            match ServerMessage::parse(&text) {
                Ok(message) => {
                    if in_tx.send(TransportEvent::Message(Box::new(message))).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring unparseable backend frame"),
            }
        }
        let _ = in_tx.send(TransportEvent::Closed {
            reason: "connection ended".to_string(),
        });
    });

    Ok(Transport {
        outbound: out_tx,
        inbound: in_rx,
    })
}

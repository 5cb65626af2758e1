// =============================================================================
// Socket connectors — the seam between the transport state machine and the
// actual WebSocket
// =============================================================================
//
// A connector opens one socket and hands back a `Connection`: a channel of
// inbound events plus a one-shot close request. The transport never touches
// tungstenite types directly; tests substitute an in-memory connector.
// =============================================================================

use std::future::Future;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// RFC 6455 normal closure.
pub const NORMAL_CLOSE: u16 = 1000;
/// RFC 6455 "no status received": a close frame without a code.
pub const NO_STATUS_CLOSE: u16 = 1005;
/// RFC 6455 "no close frame received".
pub const ABNORMAL_CLOSE: u16 = 1006;

const INBOUND_BUFFER: usize = 1024;

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// The socket closed; `code` is the peer's close code, 1005 for a close
    /// frame without one, or 1006 when the stream ended without a close frame.
    Closed { code: u16, reason: String },
    /// The socket failed mid-stream.
    Failed(String),
}

/// An open socket as seen by the transport.
pub struct Connection {
    pub inbound: mpsc::Receiver<Inbound>,
    /// Request a graceful close. Dropping the sender has the same effect.
    pub close: oneshot::Sender<()>,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<Connection>> + Send;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite connector
// ---------------------------------------------------------------------------

/// Opens real WebSocket connections and pumps frames into a channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .context("failed to connect to stream WebSocket")?;

        info!(url = %url, "stream WebSocket connected");

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(pump(ws_stream, tx, close_rx));

        Ok(Connection {
            inbound: rx,
            close: close_tx,
        })
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Forward socket frames until the socket closes, fails, or a close is
/// requested (after which the peer's close reply is awaited).
async fn pump(ws_stream: WsStream, tx: mpsc::Sender<Inbound>, mut close_rx: oneshot::Receiver<()>) {
    let (mut write, mut read) = ws_stream.split();
    let mut closing = false;

    loop {
        tokio::select! {
            _ = &mut close_rx, if !closing => {
                closing = true;
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "close frame not sent");
                    let _ = tx
                        .send(Inbound::Closed { code: NORMAL_CLOSE, reason: "client disconnect".into() })
                        .await;
                    return;
                }
            }
            msg = read.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => Inbound::Text(text),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_details(frame);
                        let _ = tx.send(Inbound::Closed { code, reason }).await;
                        return;
                    }
                    // tungstenite answers pings itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "stream WebSocket read error");
                        let _ = tx.send(Inbound::Failed(e.to_string())).await;
                        return;
                    }
                    None => {
                        let _ = tx
                            .send(Inbound::Closed { code: ABNORMAL_CLOSE, reason: "stream ended".into() })
                            .await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    debug!("transport dropped the connection, closing socket");
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            }
        }
    }
}

fn close_details(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.into_owned()))
        .unwrap_or((NO_STATUS_CLOSE, String::new()))
}

//! Duplex message transport used by the message channel.
//!
//! A [`Connector`] opens a [`TransportLink`]: commands go in through an
//! unbounded sender, and the transport reports `Open`, every inbound
//! `Message` and a final `Close` on the event receiver. A link that fails to
//! connect reports `Close` without `Open`.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Text or binary message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(bytes) => Message::Binary(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Payload),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(Payload),
    Close,
}

pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Create a link and the transport-side ends of its two queues.
    pub fn pair() -> (
        TransportLink,
        mpsc::UnboundedReceiver<TransportCommand>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        (TransportLink { commands, events }, command_rx, event_tx)
    }
}

pub trait Connector: Send + Sync {
    /// Start connecting to `url`. Must not block.
    fn open(&self, url: &str) -> TransportLink;
}

/// WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open(&self, url: &str) -> TransportLink {
        let (link, commands, events) = TransportLink::pair();
        let url = url.to_string();
        tokio::spawn(run_websocket(url, commands, events));
        link
    }
}

async fn run_websocket(
    url: String,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            warn!(%url, error = %e, "WebSocket connect failed");
            let _ = events.send(TransportEvent::Close);
            return;
        }
    };
    info!(%url, "WebSocket connected");
    let _ = events.send(TransportEvent::Open);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TransportCommand::Send(payload)) => {
                    if let Err(e) = write.send(payload.into()).await {
                        warn!(%url, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Some(TransportCommand::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(Payload::Text(text)));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = events.send(TransportEvent::Message(Payload::Binary(bytes)));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(%url, ?frame, "WebSocket closed by peer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%url, error = %e, "WebSocket read failed");
                    break;
                }
                None => break,
            },
        }
    }

    info!(%url, "WebSocket closed");
    let _ = events.send(TransportEvent::Close);
}

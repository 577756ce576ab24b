//! Client side of the rendezvous (mailbox) server protocol: JSON text
//! frames over a WebSocket, multiplexed by a `type` field.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 100;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Bind {
        appid: String,
        side: String,
    },
    Allocate,
    Claim {
        nameplate: String,
    },
    #[allow(dead_code)]
    Release {
        #[serde(skip_serializing_if = "Option::is_none")]
        nameplate: Option<String>,
    },
    Open {
        mailbox: String,
    },
    Close {
        #[serde(skip_serializing_if = "Option::is_none")]
        mailbox: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mood: Option<String>,
    },
    Add {
        phase: String,
        body: String,
    },
    #[allow(dead_code)]
    Ping {
        ping: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome { welcome: WelcomeInfo },
    Allocated { nameplate: String },
    Claimed { mailbox: String },
    Message(MailboxMessage),
    Error { error: String },
    Ack {},
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WelcomeInfo {
    #[serde(default)]
    pub motd: Option<String>,
    #[serde(default)]
    pub current_cli_utility: Option<String>,
}

/// One phase-tagged mailbox message. `side` identifies the posting peer;
/// a message carrying our own side is an echo of something we posted.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxMessage {
    pub side: String,
    pub phase: String,
    #[serde(default)]
    pub id: Option<String>,
    pub body: String,
}

/// Persistent connection to a rendezvous server.
///
/// A background reader task parses every inbound frame and pushes it onto a
/// bounded event channel in arrival order; `ack` and unrecognized frames are
/// dropped. When the socket fails the reader exits and the channel closes,
/// which consumers observe as a session-fatal error.
pub struct RendezvousClient {
    sink: WsSink,
    events: mpsc::Receiver<ServerMessage>,
    reader: JoinHandle<()>,
}

impl RendezvousClient {
    /// Dials the server, waits for its `welcome`, and binds `appid`/`side`.
    pub async fn connect(url: &str, appid: &str, side: &str) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::RendezvousUnreachable(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let first = source
            .next()
            .await
            .ok_or_else(|| Error::RendezvousUnreachable("connection closed before welcome".into()))?
            .map_err(|e| Error::RendezvousUnreachable(e.to_string()))?;
        match parse_frame(&first) {
            Some(ServerMessage::Welcome { welcome }) => {
                if let Some(motd) = welcome.motd {
                    debug!("rendezvous motd: {motd}");
                }
            }
            _ => {
                return Err(Error::Protocol(
                    "expected a welcome as the first rendezvous frame".into(),
                ))
            }
        }

        send_json(
            &mut sink,
            &ClientMessage::Bind {
                appid: appid.to_string(),
                side: side.to_string(),
            },
        )
        .await?;

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(source, tx));

        Ok(Self { sink, events, reader })
    }

    /// Next server event, in delivery order. Errors once the connection
    /// is gone.
    pub async fn next_event(&mut self) -> Result<ServerMessage> {
        self.events
            .recv()
            .await
            .ok_or_else(|| Error::Protocol("rendezvous connection closed".into()))
    }

    pub async fn allocate(&mut self) -> Result<()> {
        self.send(&ClientMessage::Allocate).await
    }

    pub async fn claim(&mut self, nameplate: &str) -> Result<()> {
        self.send(&ClientMessage::Claim {
            nameplate: nameplate.to_string(),
        })
        .await
    }

    pub async fn open(&mut self, mailbox: &str) -> Result<()> {
        self.send(&ClientMessage::Open {
            mailbox: mailbox.to_string(),
        })
        .await
    }

    /// Posts a phase message to the open mailbox. `body` is lowercase hex.
    pub async fn add(&mut self, phase: &str, body: &str) -> Result<()> {
        self.send(&ClientMessage::Add {
            phase: phase.to_string(),
            body: body.to_string(),
        })
        .await
    }

    pub async fn close_mailbox(&mut self, mailbox: Option<&str>, mood: &str) -> Result<()> {
        self.send(&ClientMessage::Close {
            mailbox: mailbox.map(str::to_string),
            mood: Some(mood.to_string()),
        })
        .await
    }

    /// Tears down the connection. Dropping the client without calling this
    /// is also fine; the socket closes with it.
    pub async fn shutdown(mut self) {
        self.sink.send(Message::Close(None)).await.ok();
        self.reader.abort();
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        send_json(&mut self.sink, msg).await
    }
}

async fn send_json(sink: &mut WsSink, msg: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(msg)
        .map_err(|e| Error::Protocol(format!("failed to encode rendezvous message: {e}")))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))
}

async fn read_loop(mut source: WsSource, tx: mpsc::Sender<ServerMessage>) {
    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("rendezvous socket error: {e}");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        let Some(event) = parse_frame(&frame) else { continue };
        if matches!(event, ServerMessage::Ack {}) {
            continue;
        }
        // A full channel blocks us here, which in turn backpressures the
        // server over TCP; consumers drain promptly during a live session.
        if tx.send(event).await.is_err() {
            break;
        }
    }
    // Dropping tx closes the event channel and wakes the consumer.
}

fn parse_frame(frame: &Message) -> Option<ServerMessage> {
    let text = frame.to_text().ok()?;
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("dropping unrecognized rendezvous frame: {e}");
            None
        }
    }
}

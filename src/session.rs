//! Session controller: owns the rendezvous connection, drives the key
//! exchange and hands back an encrypted stream to the peer.

use log::debug;
use serde::{Deserialize, Serialize};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tokio_util::sync::CancellationToken;

use crate::code;
use crate::crypto;
use crate::error::{Error, Result};
use crate::rendezvous::{MailboxMessage, RendezvousClient, ServerMessage};
use crate::transit::{EncryptedStream, TransitConnector};
use crate::{APP_ID, KEY_SIZE};

const PHASE_PAKE: &str = "pake";
const PHASE_VERSION: &str = "version";
const PHASE_TRANSIT: &str = "transit";

const PAKE_ID_SENDER: &[u8] = b"sender";
const PAKE_ID_RECEIVER: &[u8] = b"receiver";

/// Which half of the protocol this process plays. The role never travels
/// over the wire; it is fixed by whether we allocate or claim, and it
/// decides the SPAKE2 side and the transit verification labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransitHints {
    hints: Vec<String>,
}

pub struct Session {
    rendezvous: RendezvousClient,
    side: String,
    role: Role,
    cancel: CancellationToken,
    code: Option<String>,
    mailbox: Option<String>,
    key: Option<[u8; KEY_SIZE]>,
}

impl Session {
    /// Connects to the rendezvous server under a fresh random side id.
    pub async fn connect(url: &str, role: Role, cancel: CancellationToken) -> Result<Self> {
        let side = hex::encode(crypto::random_bytes(8));
        debug!("connecting to {url} as side {side}");

        let rendezvous = tokio::select! {
            client = RendezvousClient::connect(url, APP_ID, &side) => client?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        Ok(Self {
            rendezvous,
            side,
            role,
            cancel,
            code: None,
            mailbox: None,
            key: None,
        })
    }

    /// Sender: allocates a nameplate, opens its mailbox and mints the code
    /// to hand to the other human.
    pub async fn create_code(&mut self) -> Result<String> {
        self.rendezvous.allocate().await?;
        let nameplate = loop {
            match self.next_event().await? {
                ServerMessage::Allocated { nameplate } => break nameplate,
                ServerMessage::Welcome { .. } => continue,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message while waiting for allocated: {other:?}"
                    )))
                }
            }
        };
        debug!("allocated nameplate {nameplate}");

        let code = code::generate_code(&nameplate);
        self.rendezvous.open(&nameplate).await?;
        self.mailbox = Some(nameplate);
        self.code = Some(code.clone());
        Ok(code)
    }

    /// Receiver: claims the nameplate embedded in the code and opens the
    /// mailbox the server binds it to.
    pub async fn set_code(&mut self, code: &str) -> Result<()> {
        let (nameplate, _pin) = code::parse_code(code)?;
        self.rendezvous.claim(nameplate).await?;
        let mailbox = loop {
            match self.next_event().await? {
                ServerMessage::Claimed { mailbox } => break mailbox,
                ServerMessage::Welcome { .. } => continue,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message while waiting for claimed: {other:?}"
                    )))
                }
            }
        };
        debug!("claimed nameplate {nameplate}, mailbox {mailbox}");

        self.rendezvous.open(&mailbox).await?;
        self.mailbox = Some(mailbox);
        self.code = Some(code.to_string());
        Ok(())
    }

    /// Runs SPAKE2 over the mailbox and confirms the result.
    ///
    /// Both sides derive the same 32-byte key iff they started from the
    /// same code. SPAKE2 itself cannot tell a mismatched password from a
    /// matched one, so each side also posts a sealed confirmation message;
    /// failing to open the peer's confirmation is what turns a wrong code
    /// into [`Error::PakeFailed`].
    pub async fn derive_key(&mut self) -> Result<[u8; KEY_SIZE]> {
        let code = self
            .code
            .clone()
            .ok_or_else(|| Error::Protocol("no code established for this session".into()))?;

        let password = Password::new(code.as_bytes());
        let id_sender = Identity::new(PAKE_ID_SENDER);
        let id_receiver = Identity::new(PAKE_ID_RECEIVER);
        let (state, outbound) = match self.role {
            Role::Sender => Spake2::<Ed25519Group>::start_a(&password, &id_sender, &id_receiver),
            Role::Receiver => Spake2::<Ed25519Group>::start_b(&password, &id_sender, &id_receiver),
        };

        self.rendezvous.add(PHASE_PAKE, &hex::encode(&outbound)).await?;
        let peer = self.await_phase(PHASE_PAKE).await?;
        let peer_element = hex::decode(&peer.body)
            .map_err(|_| Error::Protocol("pake body is not valid hex".into()))?;

        let shared = state.finish(&peer_element).map_err(|_| Error::PakeFailed)?;
        if shared.len() != KEY_SIZE {
            return Err(Error::PakeFailed);
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&shared);

        let confirmation = crypto::encrypt(&key, b"{}")?;
        self.rendezvous
            .add(PHASE_VERSION, &hex::encode(confirmation))
            .await?;
        let peer = self.await_phase(PHASE_VERSION).await?;
        let sealed = hex::decode(&peer.body)
            .map_err(|_| Error::Protocol("version body is not valid hex".into()))?;
        crypto::decrypt(&key, &sealed).map_err(|_| Error::PakeFailed)?;

        debug!("session key established");
        self.key = Some(key);
        Ok(key)
    }

    /// Exchanges encrypted transit hints with the peer, races a direct
    /// connection and wraps the adopted socket.
    pub async fn connect_transit(&mut self) -> Result<EncryptedStream> {
        let key = self.key.ok_or_else(|| {
            Error::Protocol("transit requested before the key exchange".into())
        })?;

        let (connector, hints) = TransitConnector::start().await?;
        let hint_msg = serde_json::to_vec(&TransitHints { hints })
            .map_err(|e| Error::Protocol(format!("failed to encode transit hints: {e}")))?;
        let sealed = crypto::encrypt(&key, &hint_msg)?;
        self.rendezvous
            .add(PHASE_TRANSIT, &hex::encode(sealed))
            .await?;

        let peer = self.await_phase(PHASE_TRANSIT).await?;
        let sealed_peer = hex::decode(&peer.body)
            .map_err(|_| Error::Protocol("transit body is not valid hex".into()))?;
        let opened = crypto::decrypt(&key, &sealed_peer)?;
        let peer_hints: TransitHints = serde_json::from_slice(&opened)
            .map_err(|e| Error::Protocol(format!("malformed transit hints: {e}")))?;
        debug!("peer transit hints: {:?}", peer_hints.hints);

        let stream = connector
            .connect(&peer_hints.hints, self.role, &key, &self.cancel)
            .await?;
        Ok(EncryptedStream::new(stream, key))
    }

    /// Best-effort mailbox close and socket teardown. A completed transfer
    /// stays completed even if this never reaches the server.
    pub async fn close(mut self, mood: &str) {
        let mailbox = self.mailbox.take();
        self.rendezvous
            .close_mailbox(mailbox.as_deref(), mood)
            .await
            .ok();
        self.rendezvous.shutdown().await;
    }

    /// Waits for the peer's message in `phase`, skipping echoes of our own
    /// posts and tolerating other phases in arrival order.
    async fn await_phase(&mut self, phase: &str) -> Result<MailboxMessage> {
        loop {
            match self.next_event().await? {
                ServerMessage::Message(msg) => {
                    if msg.side == self.side {
                        continue;
                    }
                    if msg.phase == phase {
                        return Ok(msg);
                    }
                    debug!("ignoring phase {:?} while waiting for {phase:?}", msg.phase);
                }
                ServerMessage::Error { error } => {
                    return Err(Error::Protocol(format!("rendezvous server error: {error}")))
                }
                _ => {}
            }
        }
    }

    async fn next_event(&mut self) -> Result<ServerMessage> {
        tokio::select! {
            event = self.rendezvous.next_event() => event,
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

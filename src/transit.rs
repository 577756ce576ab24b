//! Direct peer-to-peer transport: hint enumeration, the inbound/outbound
//! connection race, peer verification, and the authenticated framing that
//! carries all payload bytes on the adopted socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use local_ip_address::list_afinet_netifas;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::crypto;
use crate::error::{Error, Result};
use crate::session::Role;
use crate::{KEY_SIZE, MAX_FRAME_SIZE};

const SOCKET_BUFFER_SIZE: u32 = 4 * 1024 * 1024;
const WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_DEADLINE: Duration = Duration::from_secs(5);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long the sender lets the receiver's dial land before dialing itself.
/// Without the head start both sides can dial simultaneously and adopt two
/// different sockets, stranding each end of the session.
const SENDER_DIAL_GRACE: Duration = Duration::from_millis(500);

const VERIFY_SENDER_INFO: &[u8] = b"transit-verify/sender";
const VERIFY_RECEIVER_INFO: &[u8] = b"transit-verify/receiver";

/// Races an inbound accept against outbound dials and adopts exactly one
/// TCP socket. Losing connections are closed before any payload byte is
/// written.
pub struct TransitConnector {
    adopted: Arc<Mutex<Option<TcpStream>>>,
    accept_task: JoinHandle<()>,
}

impl TransitConnector {
    /// Binds a listener on an ephemeral port and returns the dialable
    /// hints (`ip:port`) to advertise to the peer. The accept task adopts
    /// the first inbound connection and then closes the listener.
    pub async fn start() -> Result<(Self, Vec<String>)> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let listener = socket.listen(1024)?;
        let port = listener.local_addr()?.port();

        let mut hints = Vec::new();
        match list_afinet_netifas() {
            Ok(interfaces) => {
                for (_name, ip) in interfaces {
                    if let IpAddr::V4(v4) = ip {
                        if !v4.is_loopback() {
                            hints.push(format!("{v4}:{port}"));
                        }
                    }
                }
            }
            Err(e) => debug!("could not enumerate local interfaces: {e}"),
        }
        hints.push(format!("127.0.0.1:{port}"));
        debug!("listening for the peer on port {port}, hints: {hints:?}");

        let adopted = Arc::new(Mutex::new(None));
        let slot = adopted.clone();
        let accept_task = tokio::spawn(async move {
            if let Ok((stream, peer)) = listener.accept().await {
                debug!("inbound transit connection from {peer}");
                stream.set_nodelay(true).ok();
                *slot.lock().unwrap() = Some(stream);
            }
            // The listener drops here, so only one connection is ever taken.
        });

        Ok((Self { adopted, accept_task }, hints))
    }

    /// Resolves the race to a single socket and verifies the peer on it.
    pub async fn connect(
        self,
        peer_hints: &[String],
        role: Role,
        key: &[u8; KEY_SIZE],
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        let stream = self.adopt(peer_hints, role, cancel).await?;
        verify_peer(stream, role, key).await
    }

    async fn adopt(
        self,
        peer_hints: &[String],
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        if role == Role::Sender {
            if let Some(stream) = self.wait_for_inbound(SENDER_DIAL_GRACE, cancel).await? {
                self.accept_task.abort();
                return Ok(stream);
            }
        } else if let Some(stream) = self.take_adopted() {
            self.accept_task.abort();
            return Ok(stream);
        }

        for hint in peer_hints {
            if cancel.is_cancelled() {
                self.accept_task.abort();
                return Err(Error::Cancelled);
            }
            let Ok(addr) = hint.parse::<SocketAddr>() else {
                debug!("skipping undialable hint {hint:?}");
                continue;
            };
            match timeout(DIAL_TIMEOUT, dial(addr)).await {
                Ok(Ok(stream)) => {
                    // An inbound connection that landed while we were
                    // dialing wins the race; our dial is closed unused.
                    if let Some(accepted) = self.take_adopted() {
                        self.accept_task.abort();
                        debug!("inbound connection beat our dial to {addr}");
                        return Ok(accepted);
                    }
                    self.accept_task.abort();
                    debug!("adopted outbound connection to {addr}");
                    return Ok(stream);
                }
                Ok(Err(e)) => debug!("dial {addr} failed: {e}"),
                Err(_) => debug!("dial {addr} timed out"),
            }
        }

        // No dial landed; hold out for an inbound connection.
        match self.wait_for_inbound(ACCEPT_DEADLINE, cancel).await? {
            Some(stream) => {
                self.accept_task.abort();
                Ok(stream)
            }
            None => {
                self.accept_task.abort();
                Err(Error::TransitFailed)
            }
        }
    }

    async fn wait_for_inbound(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<TcpStream>> {
        let deadline = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(stream) = self.take_adopted() {
                return Ok(Some(stream));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(ACCEPT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    fn take_adopted(&self) -> Option<TcpStream> {
        self.adopted.lock().unwrap().take()
    }
}

async fn dial(addr: SocketAddr) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Confirms the adopted socket belongs to the holder of the session key.
///
/// Each side writes a 32-byte tag derived from the session key under its
/// own role label, then requires the peer's bytes to match the derivation
/// for the opposite role. An interloper who merely raced the TCP dial
/// cannot produce the tag.
async fn verify_peer(mut stream: TcpStream, role: Role, key: &[u8; KEY_SIZE]) -> Result<TcpStream> {
    let (own_label, peer_label) = match role {
        Role::Sender => (VERIFY_SENDER_INFO, VERIFY_RECEIVER_INFO),
        Role::Receiver => (VERIFY_RECEIVER_INFO, VERIFY_SENDER_INFO),
    };

    let own_tag = crypto::derive_key(key, b"", own_label);
    stream.write_all(&own_tag).await?;
    stream.flush().await?;

    let mut peer_tag = [0u8; KEY_SIZE];
    stream.read_exact(&mut peer_tag).await?;
    if peer_tag != crypto::derive_key(key, b"", peer_label) {
        return Err(Error::TransitFailed);
    }

    debug!("transit peer verified");
    Ok(stream)
}

/// Duplex framed stream over the adopted socket.
///
/// Each write becomes one frame `u32be(len) || nonce || ciphertext || tag`,
/// individually authenticated. Reads are not 1:1 with the peer's writes;
/// plaintext a caller's buffer does not consume is kept for the next read.
pub struct EncryptedStream {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    key: [u8; KEY_SIZE],
    pending: Vec<u8>,
}

impl EncryptedStream {
    pub fn new(stream: TcpStream, key: [u8; KEY_SIZE]) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half),
            key,
            pending: Vec::new(),
        }
    }

    /// Seals `plaintext` into a single frame and flushes it.
    pub async fn write_all(&mut self, plaintext: &[u8]) -> Result<()> {
        let blob = crypto::encrypt(&self.key, plaintext)?;
        self.writer.write_u32(blob.len() as u32).await?;
        self.writer.write_all(&blob).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads up to `buf.len()` plaintext bytes. `Ok(0)` means the peer
    /// closed the stream between frames. Empty frames are skipped rather
    /// than reported as end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.pending.is_empty() {
            match self.read_frame().await? {
                Some(frame) => self.pending = frame,
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed mid-read",
                )));
            }
            filled += n;
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.reader.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len as usize > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }
        let mut blob = vec![0u8; len as usize];
        self.reader.read_exact(&mut blob).await?;
        Ok(Some(crypto::decrypt(&self.key, &blob)?))
    }

    /// Flushes buffered frames and closes the write side, signalling EOF
    /// to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

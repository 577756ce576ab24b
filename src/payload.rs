//! Payload transport on top of the encrypted stream: the metadata
//! envelope, the byte pump and progress reporting.

use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::archive;
use crate::error::{Error, Result};
use crate::transit::EncryptedStream;

const PUMP_BUFFER_SIZE: usize = 1024 * 1024;
const FILE_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;
const MAX_METADATA_SIZE: usize = 64 * 1024;

/// Envelope announcing the payload before its bytes. For directories the
/// announced size is the uncompressed sum of the contained files, which
/// the receiver uses as a progress denominator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub size: u64,
    pub mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub ratio: f64,
}

pub type ProgressSender = mpsc::Sender<Progress>;

type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// Streams the file or directory at `path` to the peer: the length-prefixed
/// metadata envelope first, then the payload bytes.
pub async fn send(
    stream: &mut EncryptedStream,
    path: &Path,
    progress: Option<&ProgressSender>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut reader, meta) = prepare_source(path).await?;
    debug!("sending {:?}: {} bytes as {:?}", meta.name, meta.size, meta.mode);

    let meta_json = serde_json::to_vec(&meta)
        .map_err(|e| Error::Protocol(format!("failed to encode metadata: {e}")))?;
    let mut envelope = Vec::with_capacity(4 + meta_json.len());
    envelope.extend_from_slice(&(meta_json.len() as u32).to_be_bytes());
    envelope.extend_from_slice(&meta_json);
    stream.write_all(&envelope).await?;

    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut current = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = tokio::select! {
            n = reader.read(&mut buf) => n?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        if n == 0 {
            break;
        }
        tokio::select! {
            result = stream.write_all(&buf[..n]) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
        current += n as u64;
        report(progress, current, meta.size);
    }

    stream.shutdown().await?;
    debug!("sent {current} payload bytes");
    Ok(())
}

/// Receives one payload into `download_dir` and returns the path it was
/// saved under (renamed if the announced name already existed).
pub async fn receive(
    stream: &mut EncryptedStream,
    download_dir: &Path,
    progress: Option<&ProgressSender>,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let meta_len = u32::from_be_bytes(len_buf) as usize;
    if meta_len > MAX_METADATA_SIZE {
        return Err(Error::Protocol(format!(
            "metadata envelope of {meta_len} bytes is implausibly large"
        )));
    }

    let mut meta_buf = vec![0u8; meta_len];
    stream.read_exact(&mut meta_buf).await?;
    let meta: Metadata = serde_json::from_slice(&meta_buf)
        .map_err(|e| Error::Protocol(format!("malformed metadata envelope: {e}")))?;
    debug!("receiving {:?}: {} bytes as {:?}", meta.name, meta.size, meta.mode);

    let out_path = unique_path(download_dir, &meta.name);
    let file = File::create(&out_path).await?;
    let mut writer = BufWriter::with_capacity(FILE_WRITE_BUFFER_SIZE, file);

    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut received = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = tokio::select! {
            n = stream.read(&mut buf) => n?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        received += n as u64;
        report(progress, received, meta.size);
    }
    writer.flush().await?;

    if meta.mode == Mode::File && received < meta.size {
        return Err(Error::Truncated {
            received,
            expected: meta.size,
        });
    }

    debug!("saved {received} bytes to {}", out_path.display());
    Ok(out_path)
}

async fn prepare_source(path: &Path) -> Result<(PayloadReader, Metadata)> {
    let info = tokio::fs::metadata(path).await?;
    let name = basename(path)?;

    if info.is_dir() {
        let size = archive::uncompressed_size(path)?;
        let bytes = archive::compress_dir(path)?;
        let meta = Metadata {
            name: format!("{name}.zip"),
            size,
            mode: Mode::Dir,
        };
        Ok((Box::new(std::io::Cursor::new(bytes)), meta))
    } else {
        let file = File::open(path).await?;
        let meta = Metadata {
            name: name.to_string(),
            size: info.len(),
            mode: Mode::File,
        };
        Ok((Box::new(file), meta))
    }
}

fn basename(path: &Path) -> Result<&str> {
    path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path {} has no usable name", path.display()),
        ))
    })
}

/// First free path for `name` under `dir`, appending ` (N)` before the
/// extension until one is available.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_name(name);
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

fn report(progress: Option<&ProgressSender>, current: u64, total: u64) {
    if let Some(tx) = progress {
        if total > 0 {
            // try_send keeps the pump from ever waiting on a slow consumer;
            // a dropped update is simply superseded by the next one
            let _ = tx.try_send(Progress {
                current,
                total,
                ratio: current as f64 / total as f64,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wormpipe_{tag}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    // ============================================================================
    // Metadata Envelope
    // ============================================================================

    #[test]
    fn test_metadata_wire_shape() {
        let meta = Metadata {
            name: "x.bin".into(),
            size: 1_048_576,
            mode: Mode::File,
        };
        assert_eq!(
            serde_json::to_string(&meta).unwrap(),
            r#"{"name":"x.bin","size":1048576,"mode":"file"}"#
        );

        let parsed: Metadata =
            serde_json::from_str(r#"{"name":"d.zip","size":30,"mode":"dir"}"#).unwrap();
        assert_eq!(parsed.name, "d.zip");
        assert_eq!(parsed.size, 30);
        assert_eq!(parsed.mode, Mode::Dir);
    }

    // ============================================================================
    // Collision Renaming
    // ============================================================================

    #[test]
    fn test_collision_appends_counter_before_extension() {
        let dir = scratch_dir("collide");
        fs::write(dir.join("foo.bin"), b"one").unwrap();
        fs::write(dir.join("foo (1).bin"), b"two").unwrap();

        let path = unique_path(&dir, "foo.bin");
        assert_eq!(path, dir.join("foo (2).bin"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_no_collision_keeps_name() {
        let dir = scratch_dir("fresh");
        assert_eq!(unique_path(&dir, "report.pdf"), dir.join("report.pdf"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_collision_without_extension() {
        let dir = scratch_dir("noext");
        fs::write(dir.join("notes"), b"x").unwrap();

        assert_eq!(unique_path(&dir, "notes"), dir.join("notes (1)"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_split_name_variants() {
        assert_eq!(split_name("foo.bin"), ("foo", ".bin"));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_name("noext"), ("noext", ""));
        assert_eq!(split_name(".bashrc"), (".bashrc", ""));
    }

    // ============================================================================
    // Source Preparation
    // ============================================================================

    #[tokio::test]
    async fn test_prepare_file_source() {
        let dir = scratch_dir("prepfile");
        let path = dir.join("data.bin");
        fs::write(&path, vec![0x5A; 4096]).unwrap();

        let (mut reader, meta) = prepare_source(&path).await.unwrap();
        assert_eq!(meta.name, "data.bin");
        assert_eq!(meta.size, 4096);
        assert_eq!(meta.mode, Mode::File);

        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes.len(), 4096);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_prepare_dir_source_announces_uncompressed_sum() {
        let base = scratch_dir("prepdir");
        let dir = base.join("d");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a.txt"), &[b'a'; 10]).unwrap();
        fs::write(dir.join("sub/b.txt"), &[b'b'; 20]).unwrap();

        let (_reader, meta) = prepare_source(&dir).await.unwrap();
        assert_eq!(meta.name, "d.zip");
        assert_eq!(meta.size, 30);
        assert_eq!(meta.mode, Mode::Dir);

        let _ = fs::remove_dir_all(&base);
    }

    // ============================================================================
    // Progress Sink
    // ============================================================================

    #[test]
    fn test_full_progress_channel_never_blocks() {
        let (tx, mut rx) = mpsc::channel::<Progress>(1);
        report(Some(&tx), 1, 10);
        report(Some(&tx), 2, 10);
        report(Some(&tx), 3, 10);

        let first = rx.try_recv().expect("One update should land");
        assert_eq!(first.current, 1);
        assert!(rx.try_recv().is_err(), "Overflow updates are dropped");
    }

    #[test]
    fn test_zero_total_emits_nothing() {
        let (tx, mut rx) = mpsc::channel::<Progress>(4);
        report(Some(&tx), 5, 0);
        assert!(rx.try_recv().is_err());
    }
}

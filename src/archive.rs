//! ZIP archival for directory payloads.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::error::{Error, Result};

/// Sums the sizes of all regular files under `dir`. This is the byte count
/// announced to the peer for a directory payload.
pub fn uncompressed_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += uncompressed_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Packs `dir` into an in-memory ZIP archive.
///
/// Entry names are relative to the parent of `dir`, so the archive opens
/// into a single top-level directory named after the input. Files are
/// deflated; directories become explicit `name/` entries. Entries are
/// added in sorted order so the same tree always produces the same layout.
pub fn compress_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let base = dir.parent().unwrap_or_else(|| Path::new(""));

    add_dir(&mut zip, dir, base, options)?;

    let cursor = zip.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}

fn add_dir(
    zip: &mut ZipWriter<Cursor<Vec<u8>>>,
    path: &Path,
    base: &Path,
    options: FileOptions,
) -> Result<()> {
    zip.add_directory(format!("{}/", rel_name(path, base)?), options)
        .map_err(zip_err)?;

    let mut entries = std::fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let entry_path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            add_dir(zip, &entry_path, base, options)?;
        } else if file_type.is_file() {
            zip.start_file(rel_name(&entry_path, base)?, options)
                .map_err(zip_err)?;
            let mut file = File::open(&entry_path)?;
            std::io::copy(&mut file, zip)?;
        }
    }
    Ok(())
}

fn rel_name(path: &Path, base: &Path) -> Result<String> {
    let rel = path.strip_prefix(base).map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is outside {}", path.display(), base.display()),
        ))
    })?;
    let name = rel.to_str().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path {} is not valid UTF-8", rel.display()),
        ))
    })?;
    Ok(name.replace(std::path::MAIN_SEPARATOR, "/"))
}

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

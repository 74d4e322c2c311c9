//! Safe extraction of untrusted submission archives.
//!
//! Only regular files and directories are materialized. Anything that could
//! escape the destination (absolute names, `..` climbing above the root,
//! links) or create special filesystem objects aborts the whole extraction.
//! A partially extracted prefix may remain on disk; the job workspace is
//! deleted at job end regardless.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use thiserror::Error;

use crate::error::{Result, WorkerError};

/// Permission bits carried over from the archive (no setuid/setgid/sticky)
pub const FILE_MODE_MASK: u32 = 0o777;
/// Every extracted directory gets this mode
pub const DIR_MODE: u32 = 0o755;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("absolute path in archive: {0}")]
    AbsolutePath(String),

    #[error("path traversal in archive: {0}")]
    PathTraversal(String),

    #[error("link entries are not allowed: {0}")]
    Link(String),

    #[error("disallowed entry type {kind} for {path}")]
    DisallowedType { path: String, kind: String },

    #[error("malformed archive: {0}")]
    Malformed(#[source] io::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What an extraction produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Extract a tar archive (plain or gzip-compressed) into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> std::result::Result<ExtractSummary, ExtractError> {
    let file = File::open(archive).map_err(ExtractError::Malformed)?;
    let mut reader = BufReader::new(file);

    let compressed = reader
        .fill_buf()
        .map_err(ExtractError::Malformed)?
        .starts_with(&GZIP_MAGIC);

    if compressed {
        extract_from(GzDecoder::new(reader), dest)
    } else {
        extract_from(reader, dest)
    }
}

/// Extract an uncompressed tar stream into `dest`.
pub fn extract_from<R: Read>(reader: R, dest: &Path) -> std::result::Result<ExtractSummary, ExtractError> {
    create_dir(dest)?;

    let mut archive = Archive::new(reader);
    let mut summary = ExtractSummary::default();

    for entry in archive.entries().map_err(ExtractError::Malformed)? {
        let mut entry = entry.map_err(ExtractError::Malformed)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let kind = entry.header().entry_type();

        // pax global headers (e.g. from `git archive`) carry metadata only
        if kind == EntryType::XGlobalHeader {
            continue;
        }

        let relative = sanitize(&name)?;

        if kind.is_symlink() || kind.is_hard_link() {
            return Err(ExtractError::Link(name));
        }

        let target = dest.join(&relative);

        if kind.is_dir() {
            if relative.as_os_str().is_empty() {
                continue;
            }
            create_dir(&target)?;
            summary.directories += 1;
            continue;
        }

        if kind.is_file() {
            if relative.as_os_str().is_empty() {
                return Err(ExtractError::PathTraversal(name));
            }
            if entry.link_name_bytes().is_some() {
                return Err(ExtractError::Link(name));
            }

            let mode = entry.header().mode().map_err(ExtractError::Malformed)? & FILE_MODE_MASK;
            if let Some(parent) = target.parent() {
                create_dir(parent)?;
            }

            let write_err = |source| ExtractError::Write {
                path: target.clone(),
                source,
            };
            // later members with the same name replace earlier ones, as `tar -r` intends
            if fs::symlink_metadata(&target).map(|m| m.is_file()).unwrap_or(false) {
                fs::remove_file(&target).map_err(write_err)?;
            }
            let mut out = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&target)
                .map_err(write_err)?;
            summary.bytes += io::copy(&mut entry, &mut out).map_err(ExtractError::Malformed)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode)).map_err(write_err)?;
            summary.files += 1;
            continue;
        }

        return Err(ExtractError::DisallowedType {
            path: name,
            kind: format!("{:?}", kind),
        });
    }

    Ok(summary)
}

/// Run [`extract_archive`] off the async runtime.
pub async fn stage_archive(archive: &Path, dest: &Path) -> Result<ExtractSummary> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
        .await
        .map_err(|e| WorkerError::Unexpected(format!("archive extraction task failed: {}", e)))?
        .map_err(WorkerError::from)
}

/// Turn an archive member name into a path relative to the destination.
fn sanitize(name: &str) -> std::result::Result<PathBuf, ExtractError> {
    if name.starts_with('/') || name.starts_with('\\') || has_drive_prefix(name) {
        return Err(ExtractError::AbsolutePath(name.to_string()));
    }

    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(ExtractError::PathTraversal(name.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::AbsolutePath(name.to_string()));
            }
        }
    }
    Ok(out)
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn create_dir(path: &Path) -> std::result::Result<(), ExtractError> {
    let err = |source| ExtractError::Write {
        path: path.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "not a directory",
            )))
        }
        Err(_) => fs::create_dir_all(path).map_err(err)?,
    }
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE)).map_err(err)
}

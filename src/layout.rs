//! Where received files land and how outbound files are announced.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};

/// Which half of the source/target pair a transfer fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Source,
    Target,
}

/// How file sends are framed on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// `{"command":"SEND_FILE",...}` header followed by the file bytes.
    #[default]
    Headered,
    /// File bytes only.
    Raw,
}

/// Destination policy for a session, fixed at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirectoryResolution {
    /// Files are stored under per-kind roots using the announced base name.
    Folders {
        source_dir: PathBuf,
        target_dir: PathBuf,
        output_dir: PathBuf,
        /// Served for `REQUEST_FILE` when the request names no file.
        output_file: String,
    },
    /// Every transfer of a kind lands on one fixed path.
    FixedFiles {
        source_file: PathBuf,
        target_file: PathBuf,
        output_file: PathBuf,
    },
}

impl DirectoryResolution {
    /// Destination for an inbound transfer announced as `announced_name`.
    pub fn receive_path(&self, kind: FileKind, announced_name: &str) -> Result<PathBuf> {
        match self {
            DirectoryResolution::Folders {
                source_dir,
                target_dir,
                ..
            } => {
                let root = match kind {
                    FileKind::Source => source_dir,
                    FileKind::Target => target_dir,
                };
                Ok(resolve_dir(root).join(base_name(announced_name)?))
            }
            DirectoryResolution::FixedFiles {
                source_file,
                target_file,
                ..
            } => Ok(match kind {
                FileKind::Source => source_file.clone(),
                FileKind::Target => target_file.clone(),
            }),
        }
    }

    /// File served for `REQUEST_FILE`.
    pub fn output_path(&self, requested_name: Option<&str>) -> Result<PathBuf> {
        match self {
            DirectoryResolution::Folders {
                output_dir,
                output_file,
                ..
            } => {
                let name = match requested_name {
                    Some(name) if !name.trim().is_empty() => base_name(name)?,
                    _ => base_name(output_file)?,
                };
                Ok(resolve_dir(output_dir).join(name))
            }
            DirectoryResolution::FixedFiles { output_file, .. } => Ok(output_file.clone()),
        }
    }
}

/// A configured root that names an existing file resolves to its parent.
pub fn resolve_dir(path: &Path) -> PathBuf {
    if path.is_file() {
        return path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
    }
    path.to_path_buf()
}

/// Final path component of a peer-supplied name.
///
/// Peers announce names from their own filesystem; only the last component
/// is ever used so nothing escapes the configured root.
pub fn base_name(name: &str) -> Result<String> {
    let last = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    if last.is_empty() || last == "." || last == ".." {
        return Err(RelayError::Protocol(format!("invalid file name '{}'", name)));
    }
    Ok(last.to_string())
}

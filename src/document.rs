//! Submitted documents.
//!
//! A [`Document`] is a PDF held in memory together with the key that follows
//! it through batch items, pending placeholders and output records. The
//! `%PDF` magic bytes are checked up front so a wrong file fails with a
//! clear error before any remote call is paid for.

use crate::error::PipelineError;
use crate::model::AccountId;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// One PDF to extract.
#[derive(Clone)]
pub struct Document {
    /// Stable identifier, unique per submission.
    pub key: String,
    /// Display name, usually the original file name.
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Owning account when the caller knows it.
    pub account: Option<AccountId>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("key", &self.key)
            .field("file_name", &self.file_name)
            .field("bytes", &self.bytes.len())
            .field("account", &self.account)
            .finish()
    }
}

impl Document {
    /// Wrap in-memory PDF bytes.
    pub fn from_bytes(
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        let file_name = file_name.into();
        check_magic(Path::new(&file_name), &bytes)?;
        Ok(Self {
            key: new_key(),
            file_name,
            bytes,
            account: None,
        })
    }

    /// Read and validate a local PDF.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => PipelineError::Scratch {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        check_magic(path, &bytes)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!(path = %path.display(), bytes = bytes.len(), "Loaded document");
        Ok(Self {
            key: new_key(),
            file_name,
            bytes,
            account: None,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn new_key() -> String {
    format!("doc-{}", Uuid::new_v4().simple())
}

fn check_magic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    if bytes.len() < PDF_MAGIC.len() || &bytes[..4] != PDF_MAGIC {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(PipelineError::NotAPdf {
            path: PathBuf::from(path),
            magic,
        });
    }
    Ok(())
}

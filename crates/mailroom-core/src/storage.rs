use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub storage_key: String,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed blob storage. Callers compute SHA-256 and derive keys;
/// the store never inspects content. Backends without presigning return
/// `None` from `signed_url` and callers stream bytes directly instead.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<StoredBlob, BlobStoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError>;

    async fn signed_url(
        &self,
        key: &str,
        ttl: Duration,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Option<String>, BlobStoreError>;
}

/// Filesystem backend. Writes go to a sibling `.tmp` path first and are
/// renamed into place so a crashed write never leaves a partial blob.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> Result<StoredBlob, BlobStoreError> {
        let path = self.path_for_key(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| BlobStoreError::Unavailable(err.to_string()))?;
        }

        let tmp_path = tmp_sibling(&path);
        tokio::fs::write(&tmp_path, data)
            .await
            .map_err(|err| BlobStoreError::Unavailable(err.to_string()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| BlobStoreError::Unavailable(err.to_string()))?;

        Ok(StoredBlob {
            storage_key: key.trim_start_matches('/').to_string(),
            size_bytes: data.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_for_key(key);
        tokio::fs::read(&path)
            .await
            .map_err(|err| BlobStoreError::Unavailable(err.to_string()))
    }

    async fn signed_url(
        &self,
        _key: &str,
        _ttl: Duration,
        _filename: Option<&str>,
        _content_type: Option<&str>,
    ) -> Result<Option<String>, BlobStoreError> {
        Ok(None)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "blob".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

// RFC 3986 unreserved characters stay literal; everything else is escaped.
const RFC5987_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// `Content-Disposition: attachment` value carrying both an ASCII fallback
/// name and the RFC 5987 encoded original filename.
pub fn attachment_disposition(filename: &str) -> String {
    let ascii_name: String = filename
        .chars()
        .filter(|c| c.is_ascii())
        .map(|c| match c {
            '\\' => '_',
            '"' => '\'',
            other => other,
        })
        .collect();
    let ascii_name = if ascii_name.is_empty() {
        "attachment".to_string()
    } else {
        ascii_name
    };

    let utf8_name = utf8_percent_encode(filename, RFC5987_ESCAPE).to_string();
    format!("attachment; filename=\"{ascii_name}\"; filename*=UTF-8''{utf8_name}")
}

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::PersistenceError;

/// Blob address for one item's latest payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadKey {
    pub org_id: String,
    pub source_id: String,
    pub item_id: String,
}

impl PayloadKey {
    pub fn new(
        org_id: impl Into<String>,
        source_id: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            source_id: source_id.into(),
            item_id: item_id.into(),
        }
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(path_segment(&self.org_id))
            .join(path_segment(&self.source_id))
            .join(format!("{}.json", path_segment(&self.item_id)))
    }
}

fn path_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub key: PayloadKey,
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The stored bytes already matched; nothing was written.
    pub unchanged: bool,
}

#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Store the latest payload for an item with an atomic temp-file rename.
    ///
    /// Re-putting identical bytes is a no-op, so replayed extractions stay cheap.
    pub async fn put(&self, key: &PayloadKey, bytes: &[u8]) -> Result<StoredPayload, PersistenceError> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = key.relative_path();
        let absolute_path = self.root.join(&relative_path);
        let stored = |unchanged| StoredPayload {
            key: key.clone(),
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            unchanged,
        };

        let Some(parent) = absolute_path.parent() else {
            return Err(PersistenceError::Corrupt(format!(
                "payload path {} has no parent",
                absolute_path.display()
            )));
        };
        fs::create_dir_all(parent).await.map_err(|e| {
            PersistenceError::io(format!("creating payload directory {}", parent.display()), e)
        })?;

        match fs::read(&absolute_path).await {
            Ok(existing) if Self::sha256_hex(&existing) == content_hash => return Ok(stored(true)),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(PersistenceError::io(
                    format!("reading payload {}", absolute_path.display()),
                    err,
                ))
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| PersistenceError::io(format!("opening temp payload {}", temp_path.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| PersistenceError::io(format!("writing temp payload {}", temp_path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| PersistenceError::io(format!("flushing temp payload {}", temp_path.display()), e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PersistenceError::io(
                format!(
                    "renaming temp payload {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                ),
                err,
            ));
        }

        Ok(stored(false))
    }

    pub async fn get(&self, key: &PayloadKey) -> Result<Vec<u8>, PersistenceError> {
        let path = self.root.join(key.relative_path());
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(PersistenceError::NotFound(
                format!("{}/{}/{}", key.org_id, key.source_id, key.item_id),
            )),
            Err(err) => Err(PersistenceError::io(format!("reading payload {}", path.display()), err)),
        }
    }
}

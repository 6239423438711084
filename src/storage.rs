//! Content-addressed blob storage for accepted image bytes.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

/// File extension for an accepted content type.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path relative to the root: `blobs/{hash[0..2]}/{hash}.{ext}`.
    pub fn relative_path(content_hash: &str, content_type: &str) -> String {
        let shard = content_hash.get(..2).unwrap_or("00");
        format!("blobs/{}/{}.{}", shard, content_hash, extension_for(content_type))
    }

    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write the bytes unless the blob already exists. Returns the relative path.
    ///
    /// Data goes to a temp file in the target directory first and is renamed
    /// into place, so a crash never leaves a partially written blob.
    pub fn put(&self, content_hash: &str, content_type: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let relative = Self::relative_path(content_hash, content_type);
        let target = self.absolute_path(&relative);
        if target.exists() {
            return Ok(relative);
        }

        let dir = target
            .parent()
            .ok_or_else(|| StorageError::Unavailable(format!("bad blob path {}", target.display())))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| StorageError::Io(e.error))?;

        Ok(relative)
    }

    pub fn remove(&self, relative: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.absolute_path(relative)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

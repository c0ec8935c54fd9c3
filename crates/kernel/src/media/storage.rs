//! Media storage backends.
//!
//! Stored files are addressed by `local://` URIs so database records stay
//! independent of the directory layout on disk.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Storage backend for media files.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Write file data to the given URI.
    async fn write(&self, uri: &str, data: &[u8]) -> Result<()>;

    /// Read file data from the given URI.
    async fn read(&self, uri: &str) -> Result<Vec<u8>>;

    /// Delete the file at the given URI.
    ///
    /// Deleting a file that is already gone is not an error.
    async fn delete(&self, uri: &str) -> Result<()>;

    /// Public URL at which the file can be fetched.
    fn public_url(&self, uri: &str) -> String;

    /// Storage scheme identifier (e.g. "local").
    fn scheme(&self) -> &'static str;
}

/// Local filesystem storage rooted at a media directory.
pub struct LocalMediaStorage {
    base_path: PathBuf,
    base_url: String,
}

impl LocalMediaStorage {
    /// Create a new local storage backend.
    ///
    /// `base_path` is the directory files are written under; `base_url` is
    /// the URL prefix they are served from.
    pub fn new(base_path: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            base_url: base_url.into(),
        }
    }

    /// Resolve a `local://` URI to a filesystem path under the base directory.
    ///
    /// Rejects URIs with parent-directory components so a crafted URI cannot
    /// reach outside the media root.
    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        let Some(relative) = uri.strip_prefix("local://") else {
            bail!("invalid local URI: {uri}");
        };

        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            bail!("path traversal attempt in URI: {uri}");
        }

        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl MediaStorage for LocalMediaStorage {
    async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(uri)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("failed to create media directory")?;
        }

        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create file: {}", path.display()))?;
        file.write_all(data)
            .await
            .context("failed to write file data")?;
        file.flush().await.context("failed to flush file")?;

        debug!(uri = %uri, size = data.len(), "media file written");
        Ok(())
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.resolve(uri)?;
        fs::read(&path)
            .await
            .with_context(|| format!("failed to read file: {}", path.display()))
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let path = self.resolve(uri)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(uri = %uri, "media file deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(uri = %uri, "media file already absent");
                Ok(())
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to delete file: {}", path.display()))
            }
        }
    }

    fn public_url(&self, uri: &str) -> String {
        let relative = uri.strip_prefix("local://").unwrap_or(uri);
        format!("{}/{}", self.base_url.trim_end_matches('/'), relative)
    }

    fn scheme(&self) -> &'static str {
        "local"
    }
}

impl std::fmt::Debug for LocalMediaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStorage")
            .field("base_path", &self.base_path)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Generate a unique `local://` URI for an uploaded filename.
///
/// Files are bucketed by year and month, with a short unique prefix so two
/// uploads of the same filename never collide.
pub fn generate_uri(filename: &str) -> String {
    let now = chrono::Utc::now();
    let unique_id = Uuid::now_v7().simple().to_string();
    let safe_name = sanitize_filename(filename);
    format!(
        "local://{}/{}/{}_{}",
        now.format("%Y"),
        now.format("%m"),
        &unique_id[..8],
        safe_name
    )
}

/// Sanitize a filename for safe storage.
pub(crate) fn sanitize_filename(filename: &str) -> String {
    // Strip any path components first.
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);

    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect::<String>()
        .chars()
        .take(200)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.jpg"), "test.jpg");
        assert_eq!(sanitize_filename("my file.jpg"), "my_file.jpg");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("test<script>.jpg"), "test_script_.jpg");
    }

    #[test]
    fn test_generate_uri_shape() {
        let uri = generate_uri("photo.png");
        assert!(uri.starts_with("local://"));
        assert!(uri.ends_with("_photo.png"));

        let year = chrono::Utc::now().format("%Y").to_string();
        assert!(uri.contains(&format!("{year}/")));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let storage = LocalMediaStorage::new("/srv/media", "/files");

        for uri in [
            "local://../../etc/passwd",
            "local://2026/../../secret",
            "local://a/b/../../../c",
        ] {
            assert!(storage.resolve(uri).is_err(), "{uri} should be rejected");
        }
    }

    #[test]
    fn test_resolve_rejects_foreign_scheme() {
        let storage = LocalMediaStorage::new("/srv/media", "/files");
        assert!(storage.resolve("s3://bucket/key").is_err());
    }

    #[test]
    fn test_public_url() {
        let storage = LocalMediaStorage::new("/srv/media", "/files/");
        assert_eq!(
            storage.public_url("local://2026/08/abcd1234_test.jpg"),
            "/files/2026/08/abcd1234_test.jpg"
        );

        let storage = LocalMediaStorage::new("/srv/media", "https://cdn.example.com/media");
        assert_eq!(
            storage.public_url("local://2026/08/abcd1234_test.jpg"),
            "https://cdn.example.com/media/2026/08/abcd1234_test.jpg"
        );
    }

    #[tokio::test]
    async fn test_write_read_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalMediaStorage::new(dir.path(), "/files");

        let uri = "local://2026/08/abcd1234_test.bin";
        storage.write(uri, b"hello media").await.unwrap();

        let data = storage.read(uri).await.unwrap();
        assert_eq!(data, b"hello media");

        storage.delete(uri).await.unwrap();
        assert!(storage.read(uri).await.is_err());

        // Deleting again is a no-op, not an error.
        storage.delete(uri).await.unwrap();
    }
}

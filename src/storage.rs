use std::path::{Component, Path, PathBuf};

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use globset::GlobBuilder;
use walkdir::WalkDir;

use crate::{AppError, AppResult, LOG_TARGET};

const SCAN_CHANNEL_DEPTH: usize = 256;

/// Lazily produced storage keys. An `Err` item ends the scan.
pub type PathStream = BoxStream<'static, AppResult<String>>;

/// The file store whose contents are inventoried.
pub trait StorageAdapter: Send + Sync {
    /// Name recorded on registry entries (`storage` column).
    fn name(&self) -> &str;

    /// Stream every stored key matching `pattern`, `/`-separated and
    /// relative to the store root. Each call restarts from the beginning.
    fn scan_files(&self, pattern: &str) -> AppResult<PathStream>;
}

/// Files on the local disk under `root`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub const NAME: &'static str = "Local";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageAdapter for LocalStorage {
    fn name(&self) -> &str {
        Self::NAME
    }

    /// Must be called from within a tokio runtime; the walk runs on the
    /// blocking pool and is back-pressured by the channel.
    fn scan_files(&self, pattern: &str) -> AppResult<PathStream> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()?
            .compile_matcher();
        let root = self.root.clone();
        let (mut tx, rx) = mpsc::channel::<AppResult<String>>(SCAN_CHANNEL_DEPTH);

        tokio::task::spawn_blocking(move || {
            for entry in WalkDir::new(&root).follow_links(false).min_depth(1) {
                let item = match entry {
                    Ok(entry) => {
                        if !entry.file_type().is_file() {
                            continue;
                        }
                        let Some(key) = storage_key(&root, entry.path()) else {
                            tracing::warn!(
                                target: LOG_TARGET,
                                event = "storage_scan_unreadable_name",
                                path = %entry.path().display(),
                            );
                            continue;
                        };
                        if !matcher.is_match(&key) {
                            continue;
                        }
                        Ok(key)
                    }
                    Err(err) => Err(AppError::new("STORAGE/SCAN", err.to_string())
                        .with_context("operation", "local_storage_scan")
                        .with_context("root", root.display().to_string())),
                };
                let failed = item.is_err();
                // A closed receiver means the consumer stopped listening.
                if futures::executor::block_on(tx.send(item)).is_err() || failed {
                    break;
                }
            }
        });

        Ok(rx.boxed())
    }
}

fn storage_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[tokio::test]
    async fn scan_matches_glob_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "nc/uploads/2024/01/a.png");
        touch(dir.path(), "nc/uploads/b.pdf");
        touch(dir.path(), "nc/thumbnails/a.png");
        touch(dir.path(), "other.txt");

        let storage = LocalStorage::new(dir.path());
        let mut keys: Vec<String> = storage
            .scan_files("nc/uploads/**")
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        keys.sort();

        assert_eq!(keys, vec!["nc/uploads/2024/01/a.png", "nc/uploads/b.pdf"]);
        assert_eq!(storage.name(), "Local");
    }

    #[tokio::test]
    async fn scan_of_missing_root_yields_error_item() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().join("absent"));
        let items: Vec<AppResult<String>> =
            storage.scan_files("**").unwrap().collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().code(), "STORAGE/SCAN");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let storage = LocalStorage::new("/tmp");
        let err = match storage.scan_files("nc/[") {
            Ok(_) => panic!("pattern should not compile"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "STORAGE/BAD_PATTERN");
    }

    #[test]
    fn storage_key_uses_forward_slashes() {
        let root = Path::new("/data");
        let key = storage_key(root, &root.join("nc").join("uploads").join("a b.png"));
        assert_eq!(key.as_deref(), Some("nc/uploads/a b.png"));
    }
}

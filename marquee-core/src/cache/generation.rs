use std::{
    fmt,
    path::{Path, PathBuf},
};

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::blob_store::{BlobStore, CacheRoot};
use crate::error::{CacheError, Result};

/// Owns the single active cache generation.
///
/// Each generation lives in its own directory under `base`. Opening or
/// rolling over to a generation deletes every other generation wholesale;
/// entries are never evicted individually.
pub struct CacheManager {
    base: PathBuf,
    active: RwLock<ActiveGeneration>,
}

struct ActiveGeneration {
    name: String,
    store: BlobStore,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Open `generation` under `base`, creating it if needed and pruning any
    /// other generation left behind by a previous version.
    pub async fn open(
        base: impl Into<PathBuf>,
        generation: &str,
    ) -> Result<Self> {
        validate_generation(generation)?;
        let base = base.into();
        let store = activate(&base, generation).await?;
        prune_generations(&base, generation).await;

        info!(base = %base.display(), generation, "cache generation opened");
        Ok(Self {
            base,
            active: RwLock::new(ActiveGeneration {
                name: generation.to_string(),
                store,
            }),
        })
    }

    /// Store of the active generation. Cheap to clone; callers should not
    /// hold on to it across a rollover.
    pub async fn store(&self) -> BlobStore {
        self.active.read().await.store.clone()
    }

    pub async fn generation(&self) -> String {
        self.active.read().await.name.clone()
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Switch to `next`, deleting the previous generation. Returns `false`
    /// when `next` is already active.
    pub async fn rollover(&self, next: &str) -> Result<bool> {
        validate_generation(next)?;
        let mut active = self.active.write().await;
        if active.name == next {
            return Ok(false);
        }

        let store = activate(&self.base, next).await?;
        let previous = std::mem::replace(
            &mut *active,
            ActiveGeneration {
                name: next.to_string(),
                store,
            },
        );
        drop(active);

        previous.store.retire().await;
        prune_generations(&self.base, next).await;
        info!(
            from = %previous.name,
            to = next,
            "cache generation rolled over"
        );
        Ok(true)
    }
}

async fn activate(base: &Path, generation: &str) -> Result<BlobStore> {
    let dir = base.join(generation);
    tokio::fs::create_dir_all(&dir).await?;
    Ok(BlobStore::new(CacheRoot::new(dir)))
}

async fn prune_generations(base: &Path, keep: &str) {
    let mut entries = match tokio::fs::read_dir(base).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(base = %base.display(), error = %err, "cannot list cache generations");
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "cache generation listing interrupted");
                break;
            }
        };
        if entry.file_name() == keep {
            continue;
        }
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!(path = %path.display(), "deleted stale cache generation"),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "failed to delete stale cache generation"
            ),
        }
    }
}

fn validate_generation(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidGeneration(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;

    #[tokio::test]
    async fn open_prunes_other_generations() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("v1")).await.unwrap();

        let manager = CacheManager::open(dir.path(), "v2").await.unwrap();

        assert_eq!(manager.generation().await, "v2");
        assert!(!dir.path().join("v1").exists());
        assert!(dir.path().join("v2").exists());
    }

    #[tokio::test]
    async fn rollover_drops_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::open(dir.path(), "v1").await.unwrap();
        let key = CacheKey::layout("3");
        manager
            .store()
            .await
            .put_complete(&key, "text/xml", b"<layout/>")
            .await
            .unwrap();

        assert!(manager.rollover("v2").await.unwrap());
        assert!(!manager.rollover("v2").await.unwrap());

        assert!(manager.store().await.record(&key).await.unwrap().is_none());
        assert!(!dir.path().join("v1").exists());
    }

    #[tokio::test]
    async fn retired_store_refuses_writes_and_leaves_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::open(dir.path(), "v1").await.unwrap();
        let stale = manager.store().await;

        assert!(manager.rollover("v2").await.unwrap());
        assert!(stale.is_retired());
        assert!(!stale.same_generation(&manager.store().await));

        let result = stale
            .put_complete(&CacheKey::layout("8"), "text/xml", b"<layout/>")
            .await;
        assert!(matches!(result, Err(CacheError::Retired(_))));
        let result = stale
            .append_range(&CacheKey::media("8"), "video/mp4", 100, 0, &[1; 10], 1)
            .await;
        assert!(matches!(result, Err(CacheError::Retired(_))));
        assert!(!dir.path().join("v1").exists());
    }

    #[tokio::test]
    async fn independent_managers_do_not_share_state() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = CacheManager::open(a.path(), "v1").await.unwrap();
        let second = CacheManager::open(b.path(), "v1").await.unwrap();
        let key = CacheKey::widget("1");

        first
            .store()
            .await
            .put_complete(&key, "text/html", b"<p>hi</p>")
            .await
            .unwrap();

        assert!(second.store().await.record(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn generation_names_cannot_escape_the_base_directory() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["", "..", "../etc", "a/b"] {
            assert!(matches!(
                CacheManager::open(dir.path(), bad).await,
                Err(CacheError::InvalidGeneration(_))
            ));
        }
    }
}

//! Remembers the identity used in the previous run.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Identity, IdentityError, IdentityResult};

/// Storage for the last used identity.
pub trait IdentityCache: Send + Sync {
    fn get_identity(&self) -> IdentityResult<Option<Identity>>;
    fn store_identity(&self, identity: &Identity) -> IdentityResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheData {
    identity: Identity,
}

/// JSON file backed identity cache.
#[derive(Debug, Clone)]
pub struct FileIdentityCache {
    path: PathBuf,
}

impl FileIdentityCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityCache for FileIdentityCache {
    fn get_identity(&self) -> IdentityResult<Option<Identity>> {
        let contents = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(IdentityError::Cache(format!(
                    "{}: {}",
                    self.path.display(),
                    err
                )))
            }
        };

        let data: CacheData = serde_json::from_slice(&contents)
            .map_err(|e| IdentityError::Cache(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(data.identity))
    }

    fn store_identity(&self, identity: &Identity) -> IdentityResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| IdentityError::Cache(format!("{}: {}", parent.display(), e)))?;
        }

        let serialized = serde_json::to_vec_pretty(&CacheData {
            identity: identity.clone(),
        })
        .map_err(|e| IdentityError::Cache(e.to_string()))?;

        fs::write(&self.path, serialized)
            .map_err(|e| IdentityError::Cache(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_cache_has_no_identity() {
        let dir = tempdir().unwrap();
        let cache = FileIdentityCache::new(dir.path().join("remember.json"));
        assert_eq!(cache.get_identity().unwrap(), None);
    }

    #[test]
    fn stores_and_reloads_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("remember.json");
        let cache = FileIdentityCache::new(&path);

        cache.store_identity(&Identity::from_address("abc")).unwrap();

        let reopened = FileIdentityCache::new(&path);
        assert_eq!(
            reopened.get_identity().unwrap(),
            Some(Identity::from_address("abc"))
        );
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("remember.json");
        fs::write(&path, b"not json").unwrap();

        let cache = FileIdentityCache::new(&path);
        assert!(matches!(cache.get_identity(), Err(IdentityError::Cache(_))));
    }
}

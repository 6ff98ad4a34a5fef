use crate::error::SgubError;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

/// Paths with a patch or revert in flight. One request per path at a time.
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, path: &Path) -> Result<PathGuard, SgubError> {
        if !self.active().insert(path.to_path_buf()) {
            return Err(SgubError::Busy {
                path: path.to_path_buf(),
            });
        }
        Ok(PathGuard {
            locks: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.active().contains(path)
    }

    fn active(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct PathGuard {
    locks: PathLocks,
    path: PathBuf,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.locks.active().remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let locks = PathLocks::new();
        let path = Path::new("/steamapps/appmanifest_10.acf");
        let guard = locks.acquire(path).unwrap();
        assert!(locks.is_locked(path));
        assert!(matches!(
            locks.acquire(path).unwrap_err(),
            SgubError::Busy { .. }
        ));
        assert!(locks.acquire(Path::new("/steamapps/appmanifest_20.acf")).is_ok());
        drop(guard);
        assert!(!locks.is_locked(path));
        assert!(locks.acquire(path).is_ok());
    }
}

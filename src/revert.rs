use crate::{
    error::SgubError,
    lock::PathLocks,
    manifest::{self, backup_path},
};
use std::{fs, io, path::Path};

/// Puts the backup back in place of the live manifest. Returns `false`
/// without touching anything when there is no backup.
pub fn revert(path: &Path) -> Result<bool, SgubError> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Ok(false);
    }

    let _ = manifest::set_read_only(path, false);
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SgubError::Revert {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    fs::rename(&backup, path).map_err(|source| SgubError::Revert {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(true)
}

/// `revert` while holding the path lock shared with the patch engine.
pub fn revert_exclusive(locks: &PathLocks, path: &Path) -> Result<bool, SgubError> {
    let _guard = locks.acquire(path)?;
    revert(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fetcher::CancelToken,
        manifest::{
            load_record, scan,
            tests::{manifest_text, write_manifest},
        },
        patch::{
            tests::{facts_for_first_depot, StubFetcher},
            PatchEngine,
        },
    };

    #[test]
    fn revert_restores_pre_patch_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let original = load_record(&path).unwrap();
        let engine = PatchEngine::new(
            StubFetcher::returning(facts_for_first_depot()),
            PathLocks::new(),
        );
        let mut record = load_record(&path).unwrap();
        engine.run(&mut record, &CancelToken::new(), &|_| {}).unwrap();
        assert_ne!(load_record(&path).unwrap().fields(), original.fields());

        assert!(revert(&path).unwrap());

        let report = scan(dir.path()).unwrap();
        assert_eq!(report.records.len(), 1);
        let restored = &report.records[0];
        assert_eq!(restored.fields(), original.fields());
        assert!(!restored.has_backup);
        assert!(!restored.read_only);
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn revert_without_backup_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        assert!(!revert(&path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), manifest_text("10", "Game"));
    }

    #[test]
    fn revert_tolerates_missing_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        fs::rename(&path, backup_path(&path)).unwrap();
        assert!(revert(&path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), manifest_text("10", "Game"));
    }

    #[test]
    fn revert_waits_for_in_flight_patch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        fs::copy(&path, backup_path(&path)).unwrap();
        let locks = PathLocks::new();
        let held = locks.acquire(&path).unwrap();
        assert!(matches!(
            revert_exclusive(&locks, &path).unwrap_err(),
            SgubError::Busy { .. }
        ));
        drop(held);
        assert!(revert_exclusive(&locks, &path).unwrap());
    }
}

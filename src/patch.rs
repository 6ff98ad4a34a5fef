use crate::{
    acf::{self, AcfBlock},
    error::SgubError,
    fetcher::{CancelToken, FetchOutcome, UpdateFactFetcher, UpdateFactSet},
    lock::PathLocks,
    manifest::{
        self, ManifestRecord, KEY_BUILD_ID, KEY_DEPOT_MANIFEST, KEY_DEPOT_SIZE,
        KEY_INSTALLED_DEPOTS, KEY_SCHEDULED_AUTO_UPDATE, KEY_STATE_FLAGS, KEY_TARGET_BUILD_ID,
    },
};
use serde::Serialize;
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

const STATE_FULLY_INSTALLED: &str = "4";
const AUTO_UPDATE_OFF: &str = "0";
const STAGING_SUFFIX: &str = ".sgub-tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStage {
    Idle,
    BackingUp,
    Fetching,
    Patching,
    Done,
    Error,
}

impl PatchStage {
    pub fn label(self) -> &'static str {
        match self {
            PatchStage::Idle => "Idle",
            PatchStage::BackingUp => "Backing up",
            PatchStage::Fetching => "Fetching",
            PatchStage::Patching => "Patching",
            PatchStage::Done => "Done",
            PatchStage::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchEvent {
    pub stage: PatchStage,
    pub message: String,
    pub error: Option<String>,
    pub success: bool,
}

impl PatchEvent {
    fn progress(stage: PatchStage, message: String) -> Self {
        Self {
            stage,
            message,
            error: None,
            success: false,
        }
    }

    fn done(report: &PatchReport) -> Self {
        Self {
            stage: PatchStage::Done,
            message: format!(
                "App {} pinned to build {} ({} depot(s) updated)",
                report.app_id, report.build_id, report.depots_updated
            ),
            error: None,
            success: true,
        }
    }

    fn failed(stage: PatchStage, err: &SgubError) -> Self {
        let message = match stage {
            PatchStage::Idle => "Request rejected".to_string(),
            other => format!("{} failed", other.label()),
        };
        Self {
            stage: PatchStage::Error,
            message,
            error: Some(err.to_string()),
            success: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub app_id: String,
    pub build_id: String,
    pub depots_updated: usize,
    pub backup_created: bool,
    pub fingerprint_before: String,
    pub fingerprint_after: String,
}

pub struct PatchEngine<F> {
    fetcher: F,
    locks: PathLocks,
}

impl<F: UpdateFactFetcher> PatchEngine<F> {
    pub fn new(fetcher: F, locks: PathLocks) -> Self {
        Self { fetcher, locks }
    }

    /// Backs up, fetches and rewrites one manifest. Every stage change is
    /// reported through `progress`, ending with either a success event or an
    /// `Error` event naming the stage that failed.
    pub fn run(
        &self,
        record: &mut ManifestRecord,
        cancel: &CancelToken,
        progress: &dyn Fn(PatchEvent),
    ) -> Result<PatchReport, SgubError> {
        let mut stage = PatchStage::Idle;
        let result = self.drive(record, cancel, progress, &mut stage);
        match &result {
            Ok(report) => progress(PatchEvent::done(report)),
            Err(err) => progress(PatchEvent::failed(stage, err)),
        }
        result
    }

    fn drive(
        &self,
        record: &mut ManifestRecord,
        cancel: &CancelToken,
        progress: &dyn Fn(PatchEvent),
        stage: &mut PatchStage,
    ) -> Result<PatchReport, SgubError> {
        let _guard = self.locks.acquire(&record.path)?;
        let app_id = record.app_id().ok_or_else(|| SgubError::MissingAppId {
            path: record.path.clone(),
        })?;

        *stage = PatchStage::BackingUp;
        progress(PatchEvent::progress(
            *stage,
            format!("Backing up {}", display_name(&record.path)),
        ));
        let backup_created = ensure_backup(&record.path)?;
        record.has_backup = true;

        *stage = PatchStage::Fetching;
        progress(PatchEvent::progress(
            *stage,
            format!("Waiting for latest build of app {app_id}"),
        ));
        let facts = match self.fetcher.fetch(&app_id, cancel)? {
            FetchOutcome::Complete(facts) => facts,
            FetchOutcome::Cancelled => return Err(SgubError::Cancelled),
        };

        *stage = PatchStage::Patching;
        progress(PatchEvent::progress(
            *stage,
            format!(
                "Writing build {} with {} depot(s)",
                facts.build_id,
                facts.depots.len()
            ),
        ));
        let fingerprint_before = record.fingerprint.clone();
        let depots_updated = apply_facts(record.fields_mut(), &facts);
        let encoded = acf::encode(&record.document);
        write_protected(&record.path, &encoded).map_err(|source| SgubError::PatchWrite {
            path: record.path.clone(),
            source,
        })?;
        record.raw = encoded;
        record.fingerprint = manifest::fingerprint(&record.raw);
        record.read_only = true;

        *stage = PatchStage::Done;
        Ok(PatchReport {
            app_id,
            build_id: facts.build_id,
            depots_updated,
            backup_created,
            fingerprint_before,
            fingerprint_after: record.fingerprint.clone(),
        })
    }
}

/// Merges fetched facts into the manifest fields and returns how many depot
/// blocks were written. Depots absent from `facts` are left alone.
pub fn apply_facts(fields: &mut AcfBlock, facts: &UpdateFactSet) -> usize {
    fields.set_str(KEY_STATE_FLAGS, STATE_FULLY_INSTALLED);
    fields.set_str(KEY_BUILD_ID, facts.build_id.as_str());
    fields.set_str(KEY_TARGET_BUILD_ID, facts.build_id.as_str());
    fields.set_str(KEY_SCHEDULED_AUTO_UPDATE, AUTO_UPDATE_OFF);

    if facts.depots.is_empty() {
        return 0;
    }
    let installed = fields.block_entry(KEY_INSTALLED_DEPOTS);
    for (depot_id, depot) in &facts.depots {
        let block = installed.block_entry(depot_id);
        block.set_str(KEY_DEPOT_MANIFEST, depot.manifest.as_str());
        block.set_str(KEY_DEPOT_SIZE, depot.size.to_string());
    }
    facts.depots.len()
}

/// Copies the live manifest to its backup sibling unless one already exists.
/// The copy lands under a temporary name first; on failure nothing is left
/// behind that could pass for a backup.
pub fn ensure_backup(path: &Path) -> Result<bool, SgubError> {
    let backup = manifest::backup_path(path);
    if backup.exists() {
        return Ok(false);
    }

    let partial = partial_path(&backup);
    let result = fs::copy(path, &partial).and_then(|_| fs::rename(&partial, &backup));
    if let Err(source) = result {
        let _ = fs::remove_file(&partial);
        let _ = fs::remove_file(&backup);
        return Err(SgubError::Backup {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(true)
}

/// Rewrites a manifest that may already be write-protected, then protects it.
/// The new text is staged next to the manifest and renamed over it, so a
/// failed write leaves the old file intact with its protection restored.
fn write_protected(path: &Path, contents: &str) -> io::Result<()> {
    let was_read_only = manifest::is_read_only(path)?;
    if was_read_only {
        manifest::set_read_only(path, false)?;
    }

    let staged = staging_path(path);
    let result = fs::write(&staged, contents).and_then(|_| fs::rename(&staged, path));
    if let Err(err) = result {
        let _ = fs::remove_file(&staged);
        if was_read_only {
            let _ = manifest::set_read_only(path, true);
        }
        return Err(err);
    }
    manifest::set_read_only(path, true)
}

fn partial_path(backup: &Path) -> PathBuf {
    with_suffix(backup, ".partial")
}

fn staging_path(path: &Path) -> PathBuf {
    with_suffix(path, STAGING_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(suffix);
    PathBuf::from(raw)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        error::FetchError,
        fetcher::{
            tests::{row, ScriptedSource},
            DepotFacts, Observation, PlatformFilter, PollingFetcher,
        },
        manifest::tests::{manifest_text, write_manifest},
    };
    use std::{
        cell::RefCell,
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    pub(crate) struct StubFetcher {
        facts: Option<UpdateFactSet>,
        pub(crate) calls: AtomicUsize,
        on_fetch: Option<Box<dyn Fn()>>,
    }

    impl StubFetcher {
        pub(crate) fn returning(facts: UpdateFactSet) -> Self {
            Self {
                facts: Some(facts),
                calls: AtomicUsize::new(0),
                on_fetch: None,
            }
        }

        fn failing() -> Self {
            Self {
                facts: None,
                calls: AtomicUsize::new(0),
                on_fetch: None,
            }
        }
    }

    impl UpdateFactFetcher for StubFetcher {
        fn fetch(&self, _app_id: &str, _cancel: &CancelToken) -> Result<FetchOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = &self.on_fetch {
                hook();
            }
            match &self.facts {
                Some(facts) => Ok(FetchOutcome::Complete(facts.clone())),
                None => Err(FetchError::Transport {
                    url: "https://steamdb.invalid/app/10/history/".to_string(),
                    message: "connection refused".to_string(),
                }),
            }
        }
    }

    pub(crate) fn facts_for_first_depot() -> UpdateFactSet {
        let mut depots = BTreeMap::new();
        depots.insert(
            "101".to_string(),
            DepotFacts {
                manifest: "9999".to_string(),
                size: 4096,
            },
        );
        UpdateFactSet {
            build_id: "555".to_string(),
            depots,
        }
    }

    fn stub_engine() -> PatchEngine<StubFetcher> {
        PatchEngine::new(
            StubFetcher::returning(facts_for_first_depot()),
            PathLocks::new(),
        )
    }

    fn stages(events: &[PatchEvent]) -> Vec<PatchStage> {
        events.iter().map(|event| event.stage).collect()
    }

    #[test]
    fn merges_facts_into_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let mut record = manifest::load_record(&path).unwrap();
        let engine = stub_engine();

        let events = RefCell::new(Vec::new());
        let report = engine
            .run(&mut record, &CancelToken::new(), &|event| events.borrow_mut().push(event))
            .unwrap();

        assert_eq!(report.depots_updated, 1);
        assert!(report.backup_created);
        assert_ne!(report.fingerprint_before, report.fingerprint_after);

        let reloaded = manifest::load_record(&path).unwrap();
        let fields = reloaded.fields();
        assert_eq!(fields.get_str(KEY_STATE_FLAGS), Some("4"));
        assert_eq!(fields.get_str(KEY_SCHEDULED_AUTO_UPDATE), Some("0"));
        assert_eq!(fields.get_str(KEY_BUILD_ID), Some("555"));
        assert_eq!(fields.get_str(KEY_TARGET_BUILD_ID), Some("555"));

        let depots = fields.get_block(KEY_INSTALLED_DEPOTS).unwrap();
        let updated = depots.get_block("101").unwrap();
        assert_eq!(updated.get_str(KEY_DEPOT_MANIFEST), Some("9999"));
        assert_eq!(updated.get_str(KEY_DEPOT_SIZE), Some("4096"));
        let untouched = depots.get_block("102").unwrap();
        assert_eq!(untouched.get_str(KEY_DEPOT_MANIFEST), Some("222"));
        assert_eq!(untouched.get_str(KEY_DEPOT_SIZE), Some("2000"));

        assert!(reloaded.read_only);
        assert_eq!(reloaded.fingerprint, report.fingerprint_after);
        assert_eq!(
            stages(&events.borrow()),
            vec![
                PatchStage::BackingUp,
                PatchStage::Fetching,
                PatchStage::Patching,
                PatchStage::Done
            ]
        );
        assert!(events.borrow().last().unwrap().success);
    }

    #[test]
    fn creates_missing_depot_blocks() {
        let mut fields = AcfBlock::new();
        fields.set_str("appid", "10");
        let mut facts = facts_for_first_depot();
        facts.depots.insert(
            "103".to_string(),
            DepotFacts {
                manifest: "1".to_string(),
                size: 2,
            },
        );
        assert_eq!(apply_facts(&mut fields, &facts), 2);
        let depots = fields.get_block(KEY_INSTALLED_DEPOTS).unwrap();
        assert_eq!(depots.iter().count(), 2);
        assert_eq!(depots.get_block("103").unwrap().get_str(KEY_DEPOT_SIZE), Some("2"));
    }

    #[test]
    fn second_patch_keeps_first_backup_and_rewrites_read_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let original = fs::read_to_string(&path).unwrap();
        let engine = stub_engine();

        let mut record = manifest::load_record(&path).unwrap();
        engine.run(&mut record, &CancelToken::new(), &|_| {}).unwrap();
        assert!(manifest::is_read_only(&path).unwrap());

        let mut record = manifest::load_record(&path).unwrap();
        assert!(record.read_only);
        let report = engine.run(&mut record, &CancelToken::new(), &|_| {}).unwrap();
        assert!(!report.backup_created);
        assert!(manifest::is_read_only(&path).unwrap());

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .contains(manifest::BACKUP_SUFFIX)
            })
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(manifest::backup_path(&path)).unwrap(), original);
        assert_eq!(engine.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fetch_failure_keeps_backup_and_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let engine = PatchEngine::new(StubFetcher::failing(), PathLocks::new());
        let mut record = manifest::load_record(&path).unwrap();

        let events = RefCell::new(Vec::new());
        let err = engine
            .run(&mut record, &CancelToken::new(), &|event| events.borrow_mut().push(event))
            .unwrap_err();

        assert!(matches!(err, SgubError::Fetch(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), manifest_text("10", "Game"));
        assert!(manifest::backup_path(&path).exists());
        assert!(!manifest::is_read_only(&path).unwrap());

        let events = events.borrow();
        let last = events.last().unwrap();
        assert_eq!(last.stage, PatchStage::Error);
        assert_eq!(last.message, "Fetching failed");
        assert!(last.error.as_deref().unwrap().contains("connection refused"));
        assert!(!last.success);
    }

    #[test]
    fn incomplete_facts_hold_the_engine_in_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let source = ScriptedSource::new(vec![
            Ok(Observation {
                build_id: None,
                depots: vec![row("101", None, Some("7"), Some(8))],
            }),
            Ok(Observation::default()),
        ]);
        let fetcher = PollingFetcher::new(source.clone(), PlatformFilter::default())
            .with_interval(Duration::from_millis(5));
        let engine = PatchEngine::new(fetcher, PathLocks::new());
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            trigger.cancel();
        });

        let mut record = manifest::load_record(&path).unwrap();
        let events = RefCell::new(Vec::new());
        let err = engine
            .run(&mut record, &cancel, &|event| events.borrow_mut().push(event))
            .unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, SgubError::Cancelled));
        assert!(source.polls.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            stages(&events.borrow()),
            vec![PatchStage::BackingUp, PatchStage::Fetching, PatchStage::Error]
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), manifest_text("10", "Game"));
    }

    #[test]
    fn backup_failure_leaves_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let mut record = manifest::load_record(&path).unwrap();
        fs::remove_file(&path).unwrap();
        let engine = stub_engine();

        let err = engine.run(&mut record, &CancelToken::new(), &|_| {}).unwrap_err();

        assert!(matches!(err, SgubError::Backup { .. }));
        assert_eq!(engine.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn write_failure_reports_patch_write_and_spares_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let mut record = manifest::load_record(&path).unwrap();
        let mut fetcher = StubFetcher::returning(facts_for_first_depot());
        let sabotage = path.clone();
        fetcher.on_fetch = Some(Box::new(move || {
            fs::remove_file(&sabotage).unwrap();
            fs::create_dir(&sabotage).unwrap();
        }));
        let engine = PatchEngine::new(fetcher, PathLocks::new());

        let err = engine.run(&mut record, &CancelToken::new(), &|_| {}).unwrap_err();

        assert!(matches!(err, SgubError::PatchWrite { .. }));
        assert_eq!(
            fs::read_to_string(manifest::backup_path(&path)).unwrap(),
            manifest_text("10", "Game")
        );
        assert!(!staging_path(&path).exists());
    }

    #[cfg(unix)]
    fn write_bits(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path).unwrap().permissions().mode() & 0o222
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_of_protected_manifest_keeps_it_protected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        manifest::set_read_only(&path, true).unwrap();
        assert_eq!(write_bits(&path), 0);

        write_protected(&path, "\"AppState\"\n{\n}\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "\"AppState\"\n{\n}\n");
        assert_eq!(write_bits(&path), 0);
        assert!(!staging_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_rewrite_leaves_protected_manifest_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let before = fs::read_to_string(&path).unwrap();
        manifest::set_read_only(&path, true).unwrap();
        fs::create_dir(staging_path(&path)).unwrap();

        assert!(write_protected(&path, "truncated").is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(write_bits(&path), 0);
    }

    #[cfg(unix)]
    #[test]
    fn engine_write_failure_restores_protection() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let engine = stub_engine();
        let mut record = manifest::load_record(&path).unwrap();
        engine.run(&mut record, &CancelToken::new(), &|_| {}).unwrap();
        let patched = fs::read_to_string(&path).unwrap();
        fs::create_dir(staging_path(&path)).unwrap();

        let mut record = manifest::load_record(&path).unwrap();
        let events = RefCell::new(Vec::new());
        let err = engine
            .run(&mut record, &CancelToken::new(), &|event| events.borrow_mut().push(event))
            .unwrap_err();

        assert!(matches!(err, SgubError::PatchWrite { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), patched);
        assert_eq!(write_bits(&path), 0);
        assert_eq!(events.borrow().last().unwrap().message, "Patching failed");
    }

    #[test]
    fn concurrent_request_on_same_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "10", "Game");
        let locks = PathLocks::new();
        let _held = locks.acquire(&path).unwrap();
        let engine = PatchEngine::new(StubFetcher::returning(facts_for_first_depot()), locks);
        let mut record = manifest::load_record(&path).unwrap();

        let events = RefCell::new(Vec::new());
        let err = engine
            .run(&mut record, &CancelToken::new(), &|event| events.borrow_mut().push(event))
            .unwrap_err();

        assert!(matches!(err, SgubError::Busy { .. }));
        assert!(!manifest::backup_path(&path).exists());
        assert_eq!(engine.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(events.borrow()[0].message, "Request rejected");
    }
}

use crate::{
    acf::{self, AcfBlock, AcfDocument},
    error::SgubError,
};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

pub const BACKUP_SUFFIX: &str = ".sgub-backup";

pub const KEY_APP_ID: &str = "appid";
pub const KEY_NAME: &str = "name";
pub const KEY_STATE_FLAGS: &str = "StateFlags";
pub const KEY_BUILD_ID: &str = "buildid";
pub const KEY_TARGET_BUILD_ID: &str = "TargetBuildID";
pub const KEY_SCHEDULED_AUTO_UPDATE: &str = "ScheduledAutoUpdate";
pub const KEY_INSTALLED_DEPOTS: &str = "InstalledDepots";
pub const KEY_DEPOT_MANIFEST: &str = "manifest";
pub const KEY_DEPOT_SIZE: &str = "size";

#[derive(Debug, Clone)]
pub struct ManifestRecord {
    pub path: PathBuf,
    pub raw: String,
    pub fingerprint: String,
    pub document: AcfDocument,
    pub has_backup: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct InstalledDepot {
    pub id: String,
    pub manifest: Option<String>,
    pub size: Option<String>,
}

impl ManifestRecord {
    pub fn fields(&self) -> &AcfBlock {
        &self.document.root
    }

    pub fn fields_mut(&mut self) -> &mut AcfBlock {
        &mut self.document.root
    }

    /// App id from the manifest, falling back to the digits in the file name.
    pub fn app_id(&self) -> Option<String> {
        if let Some(id) = self.fields().get_str(KEY_APP_ID) {
            return Some(id.to_string());
        }
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(app_id_from_file_name)
            .map(|id| id.to_string())
    }

    pub fn name(&self) -> &str {
        self.fields().get_str(KEY_NAME).unwrap_or("<unnamed>")
    }

    pub fn build_id(&self) -> Option<&str> {
        self.fields().get_str(KEY_BUILD_ID)
    }

    pub fn state_flags(&self) -> Option<&str> {
        self.fields().get_str(KEY_STATE_FLAGS)
    }

    pub fn installed_depots(&self) -> Vec<InstalledDepot> {
        let Some(depots) = self.fields().get_block(KEY_INSTALLED_DEPOTS) else {
            return Vec::new();
        };
        depots
            .iter()
            .filter_map(|(id, value)| {
                let block = value.as_block()?;
                Some(InstalledDepot {
                    id: id.to_string(),
                    manifest: block.get_str(KEY_DEPOT_MANIFEST).map(str::to_string),
                    size: block.get_str(KEY_DEPOT_SIZE).map(str::to_string),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub records: Vec<ManifestRecord>,
    pub warnings: Vec<ScanWarning>,
}

/// Loads every `appmanifest_<digits>.acf` in `dir`. Files that fail to load
/// are reported as warnings; only a failed listing aborts the scan.
pub fn scan(dir: &Path) -> Result<ScanReport, SgubError> {
    let entries = fs::read_dir(dir).map_err(|source| SgubError::DirectoryUnreadable {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut report = ScanReport::default();
    let entries = entries.map(|entry| entry.map(|entry| entry.path()));
    for path in manifest_paths(dir, entries, &mut report.warnings) {
        match load_record(&path) {
            Ok(record) => report.records.push(record),
            Err(err) => report.warnings.push(ScanWarning {
                path,
                message: err.to_string(),
            }),
        }
    }
    Ok(report)
}

pub fn load_record(path: &Path) -> Result<ManifestRecord, SgubError> {
    let raw = fs::read_to_string(path).map_err(|source| SgubError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document = acf::decode(&raw).map_err(|source| SgubError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    let read_only = is_read_only(path).unwrap_or(false);
    Ok(ManifestRecord {
        path: path.to_path_buf(),
        fingerprint: fingerprint(&raw),
        raw,
        document,
        has_backup: backup_path(path).exists(),
        read_only,
    })
}

/// Matches `appmanifest_<digits>.acf` and returns the digits.
pub fn app_id_from_file_name(name: &str) -> Option<&str> {
    let digits = name.strip_prefix("appmanifest_")?.strip_suffix(".acf")?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some(digits)
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(BACKUP_SUFFIX);
    PathBuf::from(raw)
}

pub fn fingerprint(raw: &str) -> String {
    blake3::hash(raw.as_bytes()).to_hex().to_string()
}

pub fn is_read_only(path: &Path) -> io::Result<bool> {
    Ok(fs::metadata(path)?.permissions().readonly())
}

/// Sets or clears write permission for everyone (owner included).
pub fn set_read_only(path: &Path, read_only: bool) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        let mode = if read_only {
            mode & !0o222
        } else {
            mode | 0o200
        };
        perms.set_mode(mode);
    }
    #[cfg(not(unix))]
    {
        perms.set_readonly(read_only);
    }
    fs::set_permissions(path, perms)
}

/// Manifest file paths among `entries`, sorted. Entries that cannot be read
/// become warnings against `dir`.
fn manifest_paths(
    dir: &Path,
    entries: impl Iterator<Item = io::Result<PathBuf>>,
    warnings: &mut Vec<ScanWarning>,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warnings.push(ScanWarning {
                    path: dir.to_path_buf(),
                    message: format!("unreadable directory entry: {err}"),
                });
                continue;
            }
        };
        let is_manifest = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(app_id_from_file_name)
            .is_some();
        if is_manifest {
            paths.push(path);
        }
    }
    paths.sort();
    paths
}

use crate::{acf, error::FormatError};
use directories::BaseDirs;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Existing `steamapps` directories of every Steam library on this machine.
pub fn detect_steamapps_dirs() -> Vec<PathBuf> {
    let Some(base) = BaseDirs::new() else {
        return Vec::new();
    };
    let home = base.home_dir();
    let roots = [
        home.join(".local/share/Steam"),
        home.join(".steam/steam"),
        home.join(".var/app/com.valvesoftware.Steam/.local/share/Steam"),
    ];
    steamapps_dirs_from_roots(&roots)
}

pub fn steamapps_dirs_from_roots(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut libraries = Vec::new();
    for root in roots {
        let vdf = root.join("steamapps/libraryfolders.vdf");
        if let Ok(raw) = fs::read_to_string(&vdf) {
            if let Ok(paths) = parse_library_folders(&raw) {
                libraries.extend(paths);
            }
        }
        libraries.push(root.clone());
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    for library in libraries {
        let steamapps = library.join("steamapps");
        if !steamapps.is_dir() {
            continue;
        }
        let steamapps = fs::canonicalize(&steamapps).unwrap_or(steamapps);
        if !dirs.contains(&steamapps) {
            dirs.push(steamapps);
        }
    }
    dirs
}

/// Library roots listed in `libraryfolders.vdf`. Handles the current layout
/// (`"0" { "path" "..." }`) and the older flat one (`"1" "..."`).
pub fn parse_library_folders(raw: &str) -> Result<Vec<PathBuf>, FormatError> {
    let document = acf::decode(raw)?;
    let mut paths = Vec::new();
    for (key, value) in document.root.iter() {
        if !key.bytes().all(|byte| byte.is_ascii_digit()) {
            continue;
        }
        let path = match value {
            acf::AcfValue::Block(block) => block.get_str("path"),
            acf::AcfValue::Str(path) => Some(path.as_str()),
        };
        if let Some(path) = path.filter(|path| !path.is_empty()) {
            paths.push(PathBuf::from(path));
        }
    }
    Ok(paths)
}

pub fn looks_like_steamapps(path: &Path) -> bool {
    path.file_name().and_then(|name| name.to_str()) == Some("steamapps")
        || path.join("libraryfolders.vdf").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_current_library_layout() {
        let raw = "\"libraryfolders\"\n{\n\t\"0\"\n\t{\n\t\t\"path\"\t\t\"/home/u/.local/share/Steam\"\n\t\t\"apps\"\n\t\t{\n\t\t\t\"228980\"\t\t\"123\"\n\t\t}\n\t}\n\t\"1\"\n\t{\n\t\t\"path\"\t\t\"D:\\\\SteamLibrary\"\n\t}\n}\n";
        let paths = parse_library_folders(raw).unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/u/.local/share/Steam"),
                PathBuf::from("D:\\SteamLibrary")
            ]
        );
    }

    #[test]
    fn parses_legacy_library_layout() {
        let raw = "\"LibraryFolders\" { \"TimeNextStatsReport\" \"1\" \"ContentStatsID\" \"2\" \"1\" \"/mnt/games\" }";
        assert_eq!(
            parse_library_folders(raw).unwrap(),
            vec![PathBuf::from("/mnt/games")]
        );
    }

    #[test]
    fn collects_existing_steamapps_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Steam");
        let extra = dir.path().join("Extra");
        fs::create_dir_all(root.join("steamapps")).unwrap();
        fs::create_dir_all(extra.join("steamapps")).unwrap();
        let vdf = format!(
            "\"libraryfolders\" {{ \"0\" {{ \"path\" \"{}\" }} \"1\" {{ \"path\" \"{}\" }} \"2\" {{ \"path\" \"{}\" }} }}",
            root.display(),
            extra.display(),
            dir.path().join("Gone").display()
        );
        fs::write(root.join("steamapps/libraryfolders.vdf"), vdf).unwrap();

        let dirs = steamapps_dirs_from_roots(&[root.clone()]);
        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().all(|path| looks_like_steamapps(path)));
    }
}

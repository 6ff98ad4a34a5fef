use crate::{
    config::{self, AppConfig},
    error::SgubError,
    fetcher::{CancelToken, PlatformFilter, PollingFetcher},
    lock::PathLocks,
    manifest::{self, ManifestRecord},
    patch::{PatchEngine, PatchEvent, PatchReport, PatchStage},
    revert, steam,
    steamdb::SteamDbSource,
};
use anyhow::{bail, Context, Result};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};
use time::OffsetDateTime;

const LOG_CAPACITY: usize = 400;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    Ui,
    Cli,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing { prompt: String, buffer: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogChoice {
    Yes,
    No,
}

#[derive(Debug, Clone)]
pub enum DialogKind {
    Patch { path: PathBuf },
    Revert { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub title: String,
    pub message: String,
    pub yes_label: String,
    pub no_label: String,
    pub choice: DialogChoice,
    pub kind: DialogKind,
}

#[derive(Debug)]
pub struct ActivePatch {
    pub path: PathBuf,
    pub name: String,
    pub stage: PatchStage,
    cancel: CancelToken,
    worker: JoinHandle<()>,
}

enum PatchMessage {
    Progress(PatchEvent),
    Completed { path: PathBuf, report: PatchReport },
    Failed { path: PathBuf, error: String, cancelled: bool },
}

pub struct App {
    pub config: AppConfig,
    pub mode: StartupMode,
    pub directory: Option<PathBuf>,
    pub libraries: Vec<PathBuf>,
    pub records: Vec<ManifestRecord>,
    pub selected: usize,
    pub status: String,
    pub input_mode: InputMode,
    pub dialog: Option<Dialog>,
    pub logs: Vec<LogEntry>,
    pub log_scroll: usize,
    pub should_quit: bool,
    pub patch_active: Option<ActivePatch>,
    locks: PathLocks,
    log_path: PathBuf,
    patch_tx: Sender<PatchMessage>,
    patch_rx: Receiver<PatchMessage>,
}

impl App {
    pub fn initialize(mode: StartupMode) -> Result<Self> {
        let config = AppConfig::load_or_create()?;
        let log_path = config::log_path()?;
        let libraries = steam::detect_steamapps_dirs();
        let directory = config
            .last_directory
            .clone()
            .or_else(|| libraries.first().cloned());
        let (patch_tx, patch_rx) = mpsc::channel();

        let mut app = App {
            config,
            mode,
            directory,
            libraries,
            records: Vec::new(),
            selected: 0,
            status: "Ready".to_string(),
            input_mode: InputMode::Normal,
            dialog: None,
            logs: Vec::new(),
            log_scroll: 0,
            should_quit: false,
            patch_active: None,
            locks: PathLocks::new(),
            log_path,
            patch_tx,
            patch_rx,
        };

        if mode == StartupMode::Ui {
            if app.libraries.is_empty() {
                app.log_warn(
                    "No Steam library detected; press o to enter a steamapps path".to_string(),
                );
            } else {
                let found = app.libraries.len();
                app.log_info(format!("Detected {found} Steam library folder(s)"));
            }
            if app.directory.is_some() {
                app.rescan();
            }
        }
        Ok(app)
    }

    pub fn selected_record(&self) -> Option<&ManifestRecord> {
        self.records.get(self.selected)
    }

    pub fn clamp_selection(&mut self) {
        if self.records.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.records.len() {
            self.selected = self.records.len() - 1;
        }
    }

    pub fn select_next(&mut self) {
        self.selected = self.selected.saturating_add(1);
        self.clamp_selection();
    }

    pub fn select_prev(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    /// Reloads the manifest list from the current directory.
    pub fn rescan(&mut self) {
        let Some(dir) = self.directory.clone() else {
            self.status = "No directory selected".to_string();
            return;
        };
        match manifest::scan(&dir) {
            Ok(report) => {
                for warning in &report.warnings {
                    self.log_warn(format!(
                        "Skipped {}: {}",
                        display_path(&warning.path),
                        warning.message
                    ));
                }
                let mut records = report.records;
                records.sort_by(|a, b| a.name().to_lowercase().cmp(&b.name().to_lowercase()));
                self.status = format!("{} manifest(s) in {}", records.len(), dir.display());
                self.records = records;
                self.clamp_selection();
            }
            Err(err) => {
                self.records.clear();
                self.status = format!("Scan failed: {err}");
                self.log_error(format!("Scan failed: {err}"));
            }
        }
    }

    pub fn set_directory(&mut self, path: PathBuf) {
        if !steam::looks_like_steamapps(&path) {
            self.log_warn(format!(
                "{} does not look like a steamapps folder",
                path.display()
            ));
        }
        self.log_info(format!("Directory set to {}", path.display()));
        self.directory = Some(path.clone());
        self.selected = 0;
        self.config.last_directory = Some(path);
        if let Err(err) = self.config.save() {
            self.log_error(format!("Saving config failed: {err}"));
        }
        self.rescan();
    }

    pub fn cycle_library(&mut self) {
        if self.libraries.is_empty() {
            self.status = "No Steam libraries detected".to_string();
            return;
        }
        let next = self
            .directory
            .as_ref()
            .and_then(|current| self.libraries.iter().position(|lib| lib == current))
            .map(|index| (index + 1) % self.libraries.len())
            .unwrap_or(0);
        let path = self.libraries[next].clone();
        self.set_directory(path);
    }

    pub fn enter_directory_input(&mut self) {
        let buffer = self
            .directory
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        self.input_mode = InputMode::Editing {
            prompt: "steamapps folder".to_string(),
            buffer,
        };
    }

    pub fn submit_directory(&mut self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.status = "Directory unchanged".to_string();
            return;
        }
        self.set_directory(expand_home(trimmed));
    }

    pub fn request_patch(&mut self) {
        if self.patch_active.is_some() {
            self.status = "A patch is already running".to_string();
            return;
        }
        let Some(record) = self.selected_record() else {
            self.status = "No manifest selected".to_string();
            return;
        };
        let path = record.path.clone();
        let name = record.name().to_string();
        if !self.config.confirm_actions {
            self.start_patch(path);
            return;
        }
        self.dialog = Some(Dialog {
            title: "Patch this game?".to_string(),
            message: format!(
                "{name}\nThe manifest is backed up once, then pinned to the latest build.\nMake sure Steam is fully closed."
            ),
            yes_label: "Patch".to_string(),
            no_label: "Cancel".to_string(),
            choice: DialogChoice::No,
            kind: DialogKind::Patch { path },
        });
    }

    pub fn request_revert(&mut self) {
        let Some(record) = self.selected_record() else {
            self.status = "No manifest selected".to_string();
            return;
        };
        if !record.has_backup {
            self.status = format!("Nothing to revert for {}", record.name());
            return;
        }
        if self.locks.is_locked(&record.path) {
            self.status = format!("{} is busy", record.name());
            return;
        }
        let path = record.path.clone();
        let name = record.name().to_string();
        if !self.config.confirm_actions {
            self.revert_path(&path);
            return;
        }
        self.dialog = Some(Dialog {
            title: "Revert this game?".to_string(),
            message: format!(
                "{name}\nRestores the manifest from its backup.\nMake sure Steam is fully closed."
            ),
            yes_label: "Revert".to_string(),
            no_label: "Cancel".to_string(),
            choice: DialogChoice::No,
            kind: DialogKind::Revert { path },
        });
    }

    pub fn dialog_set_choice(&mut self, choice: DialogChoice) {
        if let Some(dialog) = &mut self.dialog {
            dialog.choice = choice;
        }
    }

    pub fn dialog_toggle_choice(&mut self) {
        if let Some(dialog) = &mut self.dialog {
            dialog.choice = match dialog.choice {
                DialogChoice::Yes => DialogChoice::No,
                DialogChoice::No => DialogChoice::Yes,
            };
        }
    }

    pub fn dialog_confirm(&mut self) {
        let Some(dialog) = self.dialog.take() else {
            return;
        };
        if dialog.choice != DialogChoice::Yes {
            self.status = "Cancelled".to_string();
            return;
        }
        match dialog.kind {
            DialogKind::Patch { path } => self.start_patch(path),
            DialogKind::Revert { path } => self.revert_path(&path),
        }
    }

    pub fn start_patch(&mut self, path: PathBuf) {
        if self.patch_active.is_some() {
            self.status = "A patch is already running".to_string();
            return;
        }
        let Some(record) = self.records.iter().find(|record| record.path == path).cloned() else {
            self.log_error(format!("Manifest vanished: {}", path.display()));
            return;
        };

        let cancel = CancelToken::new();
        let name = record.name().to_string();
        self.status = format!("Processing {name}...");
        self.log_info(format!("Patch started: {name} ({})", path.display()));

        let engine = self.patch_engine();
        let tx = self.patch_tx.clone();
        let worker_cancel = cancel.clone();
        let worker_path = path.clone();
        let worker = thread::spawn(move || {
            let mut record = record;
            let progress_tx = tx.clone();
            let result = engine.run(&mut record, &worker_cancel, &|event| {
                let _ = progress_tx.send(PatchMessage::Progress(event));
            });
            let message = match result {
                Ok(report) => PatchMessage::Completed {
                    path: worker_path,
                    report,
                },
                Err(err) => PatchMessage::Failed {
                    path: worker_path,
                    cancelled: matches!(err, SgubError::Cancelled),
                    error: err.to_string(),
                },
            };
            let _ = tx.send(message);
        });
        self.patch_active = Some(ActivePatch {
            path,
            name,
            stage: PatchStage::Idle,
            cancel,
            worker,
        });
    }

    pub fn cancel_patch(&mut self) {
        if let Some(active) = &self.patch_active {
            active.cancel.cancel();
            self.status = format!("Cancelling {}...", active.name);
        }
    }

    /// Drains worker messages; called once per UI tick.
    pub fn poll_patches(&mut self) {
        loop {
            let message = match self.patch_rx.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            match message {
                PatchMessage::Progress(event) => self.apply_patch_event(event),
                PatchMessage::Completed { path, report } => {
                    self.patch_active = None;
                    self.status = format!(
                        "Patched app {} to build {}",
                        report.app_id, report.build_id
                    );
                    self.log_info(format!(
                        "Patched {}: build {}, {} depot(s), backup {}",
                        display_path(&path),
                        report.build_id,
                        report.depots_updated,
                        if report.backup_created { "created" } else { "reused" }
                    ));
                    self.rescan();
                }
                PatchMessage::Failed {
                    path,
                    error,
                    cancelled,
                } => {
                    self.patch_active = None;
                    if cancelled {
                        self.status = "Patch cancelled".to_string();
                        self.log_warn(format!("Patch cancelled: {}", display_path(&path)));
                    } else {
                        self.status = format!("Patch failed: {error}");
                    }
                    self.rescan();
                }
            }
        }
    }

    fn apply_patch_event(&mut self, event: PatchEvent) {
        if let Some(active) = &mut self.patch_active {
            active.stage = event.stage;
        }
        match (&event.error, event.stage) {
            (Some(error), _) => self.log_error(format!("{}: {error}", event.message)),
            (None, PatchStage::Done) => self.log_info(event.message),
            (None, stage) => {
                self.status = format!("Processing... ({})", stage.label());
                self.log_info(event.message);
            }
        }
    }

    pub fn revert_path(&mut self, path: &Path) {
        match revert::revert_exclusive(&self.locks, path) {
            Ok(true) => {
                self.status = format!("Reverted {}", display_path(path));
                self.log_info(format!("Reverted {}", path.display()));
            }
            Ok(false) => {
                self.status = format!("Nothing to revert for {}", display_path(path));
                self.log_warn(format!("No backup for {}", path.display()));
            }
            Err(err) => {
                self.status = format!("Revert failed: {err}");
                self.log_error(format!("Revert failed: {err}"));
            }
        }
        self.rescan();
    }

    /// Runs one patch on the calling thread, forwarding every event.
    pub fn patch_blocking(
        &mut self,
        record: &mut ManifestRecord,
        on_event: &dyn Fn(&PatchEvent),
    ) -> Result<PatchReport> {
        let engine = self.patch_engine();
        let cancel = CancelToken::new();
        let result = engine.run(record, &cancel, &|event| on_event(&event));
        match result {
            Ok(report) => {
                self.log_info(format!(
                    "Patched {} to build {}",
                    display_path(&record.path),
                    report.build_id
                ));
                Ok(report)
            }
            Err(err) => {
                self.log_error(format!("Patch of {} failed: {err}", record.path.display()));
                Err(err).context("patch manifest")
            }
        }
    }

    pub fn revert_blocking(&mut self, path: &Path) -> Result<()> {
        match revert::revert_exclusive(&self.locks, path) {
            Ok(true) => {
                self.log_info(format!("Reverted {}", path.display()));
                Ok(())
            }
            Ok(false) => {
                let err = SgubError::RevertUnavailable {
                    path: path.to_path_buf(),
                };
                self.log_warn(err.to_string());
                Err(err.into())
            }
            Err(err) => {
                self.log_error(format!("Revert failed: {err}"));
                Err(err.into())
            }
        }
    }

    /// The directory to operate on, or an error explaining how to pick one.
    pub fn require_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) => Ok(dir.clone()),
            None => bail!("No steamapps directory configured or detected; pass --dir <path>"),
        }
    }

    /// Cancels the active patch and waits for its worker, so no file stage
    /// is cut off by process exit.
    pub fn shutdown(&mut self) {
        let Some(active) = self.patch_active.take() else {
            return;
        };
        active.cancel.cancel();
        self.log_warn(format!("Stopping patch of {} before exit", active.name));
        if active.worker.join().is_err() {
            self.log_error(format!("Patch worker for {} panicked", active.name));
        }
        self.poll_patches();
    }

    fn patch_engine(&self) -> PatchEngine<PollingFetcher<SteamDbSource>> {
        let fetcher = PollingFetcher::new(
            SteamDbSource::new(&self.config.history_base_url),
            PlatformFilter::new(&self.config.platform),
        )
        .with_interval(self.config.poll_interval());
        PatchEngine::new(fetcher, self.locks.clone())
    }

    pub fn scroll_log_up(&mut self, lines: usize) {
        let max = self.logs.len().saturating_sub(1);
        self.log_scroll = self.log_scroll.saturating_add(lines).min(max);
    }

    pub fn scroll_log_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
    }

    pub fn log_info(&mut self, message: String) {
        self.push_log(LogLevel::Info, message);
    }

    pub fn log_warn(&mut self, message: String) {
        self.push_log(LogLevel::Warn, message);
    }

    pub fn log_error(&mut self, message: String) {
        self.push_log(LogLevel::Error, message);
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        if self.log_scroll > 0 {
            self.log_scroll = self.log_scroll.saturating_add(1);
        }

        let now = OffsetDateTime::now_utc();
        let at = format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second());
        self.logs.push(LogEntry {
            at,
            level,
            message: message.clone(),
        });

        if self.logs.len() > LOG_CAPACITY {
            let overflow = self.logs.len() - LOG_CAPACITY;
            self.logs.drain(0..overflow);
            self.log_scroll = self.log_scroll.saturating_sub(overflow);
        }

        if self.mode == StartupMode::Cli && level != LogLevel::Info {
            eprintln!("[{}] {message}", log_level_label(level));
        }
        let _ = append_log_file(&self.log_path, now, level, &message);
    }
}

pub fn log_level_label(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
    }
}

fn append_log_file(
    path: &Path,
    at: OffsetDateTime,
    level: LogLevel,
    message: &str,
) -> std::io::Result<()> {
    let label = log_level_label(level);
    let stamp = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    );
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{stamp} [{label}] {message}")
}

pub fn display_path(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn expand_home(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(base) = directories::BaseDirs::new() {
            return base.home_dir().join(rest);
        }
    }
    PathBuf::from(value)
}

use crate::{
    app::{App, StartupMode},
    manifest::{self, ManifestRecord},
    patch::PatchEvent,
    steam, ui,
};
use anyhow::{bail, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    dir: Option<PathBuf>,
}

enum CliAction {
    Ui,
    Command {
        command: CliCommand,
        format: OutputFormat,
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    List,
    Patch(String),
    Revert(String),
    Libraries,
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = parse_args(&args)?;
    match action {
        CliAction::Ui => {
            let mut app = App::initialize(StartupMode::Ui)?;
            ui::run(&mut app)
        }
        CliAction::Command {
            command,
            format,
            dir,
        } => match command {
            CliCommand::Help => {
                print_help();
                Ok(())
            }
            CliCommand::Version => {
                println!("SGUB v{}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            _ => {
                let mut app = App::initialize(StartupMode::Cli)?;
                if let Some(dir) = dir {
                    app.directory = Some(dir);
                }
                run_command(&mut app, command, format)
            }
        },
    }
}

fn parse_args(args: &[String]) -> Result<CliAction> {
    if args.is_empty() {
        return Ok(CliAction::Ui);
    }

    if matches!(args.first().map(|s| s.as_str()), Some("--help" | "-h" | "help")) {
        return Ok(command_only(CliCommand::Help));
    }
    if matches!(args.first().map(|s| s.as_str()), Some("--version" | "-V" | "version")) {
        return Ok(command_only(CliCommand::Version));
    }

    let (global, tokens) = parse_global_options(args)?;
    let Some(command) = parse_subcommand(&tokens)? else {
        return Ok(command_only(CliCommand::Help));
    };
    Ok(CliAction::Command {
        command,
        format: global.format,
        dir: global.dir,
    })
}

fn command_only(command: CliCommand) -> CliAction {
    CliAction::Command {
        command,
        format: OutputFormat::Text,
        dir: None,
    }
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut dir = None;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = parse_format(value)?;
            continue;
        }
        if arg == "--format" {
            let Some(value) = iter.next() else {
                bail!("--format requires a value");
            };
            format = parse_format(value)?;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--dir=") {
            dir = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--dir" {
            let Some(value) = iter.next() else {
                bail!("--dir requires a path");
            };
            dir = Some(PathBuf::from(value));
            continue;
        }
        tokens.push(arg.to_string());
    }

    Ok((GlobalOptions { format, dir }, tokens))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    match OutputFormat::parse(value) {
        Some(format) => Ok(format),
        None => bail!("Unknown format: {value} (use 'text' or 'json')"),
    }
}

fn parse_subcommand(tokens: &[String]) -> Result<Option<CliCommand>> {
    let Some(head) = tokens.first() else {
        return Ok(None);
    };
    let command = match head.as_str() {
        "list" => CliCommand::List,
        "patch" => CliCommand::Patch(require_app_id(tokens, "patch")?),
        "revert" => CliCommand::Revert(require_app_id(tokens, "revert")?),
        "libraries" => CliCommand::Libraries,
        "help" => CliCommand::Help,
        "version" => CliCommand::Version,
        other => bail!("Unknown command: {other} (see 'sgub help')"),
    };
    Ok(Some(command))
}

fn require_app_id(tokens: &[String], command: &str) -> Result<String> {
    let Some(value) = tokens.get(1) else {
        bail!("{command} requires an app id");
    };
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        bail!("Invalid app id: {value}");
    }
    Ok(value.to_string())
}

fn run_command(app: &mut App, command: CliCommand, format: OutputFormat) -> Result<()> {
    match command {
        CliCommand::List => list_manifests(app, format),
        CliCommand::Patch(app_id) => patch_manifest(app, &app_id, format),
        CliCommand::Revert(app_id) => revert_manifest(app, &app_id, format),
        CliCommand::Libraries => list_libraries(app, format),
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

#[derive(Serialize)]
struct ManifestListItem {
    app_id: Option<String>,
    name: String,
    build_id: Option<String>,
    state_flags: Option<String>,
    has_backup: bool,
    read_only: bool,
    fingerprint: String,
    path: String,
}

impl ManifestListItem {
    fn from_record(record: &ManifestRecord) -> Self {
        Self {
            app_id: record.app_id(),
            name: record.name().to_string(),
            build_id: record.build_id().map(str::to_string),
            state_flags: record.state_flags().map(str::to_string),
            has_backup: record.has_backup,
            read_only: record.read_only,
            fingerprint: record.fingerprint.clone(),
            path: record.path.display().to_string(),
        }
    }
}

fn list_manifests(app: &mut App, format: OutputFormat) -> Result<()> {
    let dir = app.require_directory()?;
    let report = manifest::scan(&dir)?;
    for warning in &report.warnings {
        app.log_warn(format!(
            "Skipped {}: {}",
            warning.path.display(),
            warning.message
        ));
    }
    let mut items: Vec<ManifestListItem> = report
        .records
        .iter()
        .map(ManifestListItem::from_record)
        .collect();
    items.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No manifests in {}", dir.display());
            }
            for item in items {
                let state = if item.read_only {
                    "patched"
                } else if item.has_backup {
                    "backup"
                } else {
                    "-"
                };
                println!(
                    "{app_id:>10} {build:>12} {state:<8} {hash} {name}",
                    app_id = item.app_id.as_deref().unwrap_or("?"),
                    build = item.build_id.as_deref().unwrap_or("?"),
                    hash = &item.fingerprint[..12.min(item.fingerprint.len())],
                    name = item.name
                );
            }
        }
    }
    Ok(())
}

fn find_record(app: &mut App, app_id: &str) -> Result<ManifestRecord> {
    let dir = app.require_directory()?;
    let path = dir.join(format!("appmanifest_{app_id}.acf"));
    if path.is_file() {
        return Ok(manifest::load_record(&path)?);
    }
    let report = manifest::scan(&dir)?;
    match report
        .records
        .into_iter()
        .find(|record| record.app_id().as_deref() == Some(app_id))
    {
        Some(record) => Ok(record),
        None => bail!("No manifest for app {app_id} in {}", dir.display()),
    }
}

fn patch_manifest(app: &mut App, app_id: &str, format: OutputFormat) -> Result<()> {
    let mut record = find_record(app, app_id)?;
    let print_event = |event: &PatchEvent| {
        if format == OutputFormat::Text {
            match &event.error {
                Some(error) => println!("[{}] {}: {error}", event.stage.label(), event.message),
                None => println!("[{}] {}", event.stage.label(), event.message),
            }
        }
    };
    let report = app.patch_blocking(&mut record, &print_event)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!(
                "Patched {} ({}) to build {}: {} depot(s), backup {}",
                record.name(),
                report.app_id,
                report.build_id,
                report.depots_updated,
                if report.backup_created { "created" } else { "kept" }
            );
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RevertOutput {
    app_id: String,
    path: String,
    reverted: bool,
}

fn revert_manifest(app: &mut App, app_id: &str, format: OutputFormat) -> Result<()> {
    let dir = app.require_directory()?;
    let path = dir.join(format!("appmanifest_{app_id}.acf"));
    app.revert_blocking(&path)?;

    match format {
        OutputFormat::Json => {
            let output = RevertOutput {
                app_id: app_id.to_string(),
                path: path.display().to_string(),
                reverted: true,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => println!("Reverted {}", path.display()),
    }
    Ok(())
}

fn list_libraries(app: &App, format: OutputFormat) -> Result<()> {
    let libraries: Vec<String> = app
        .libraries
        .iter()
        .map(|path| path.display().to_string())
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&libraries)?);
        }
        OutputFormat::Text => {
            if libraries.is_empty() {
                println!("No Steam libraries detected");
            }
            for library in libraries {
                let marker = if steam::looks_like_steamapps(&PathBuf::from(&library)) {
                    ""
                } else {
                    " (?)"
                };
                println!("{library}{marker}");
            }
        }
    }
    Ok(())
}

fn print_help() {
    println!("SGUB v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  sgub                          Launch TUI");
    println!("  sgub list                     List app manifests");
    println!("  sgub patch <appid>            Pin a manifest to the latest build");
    println!("  sgub revert <appid>           Restore a manifest from its backup");
    println!("  sgub libraries                Show detected steamapps folders");
    println!();
    println!("Global options:");
    println!("  --dir <path>                  steamapps folder (default: last used)");
    println!("  --format <json|text>          Output format");
    println!("  -h, --help                    Show help");
    println!("  -V, --version                 Show version");
}

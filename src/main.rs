mod acf;
mod app;
mod cli;
mod config;
mod error;
mod fetcher;
mod lock;
mod manifest;
mod patch;
mod revert;
mod steam;
mod steamdb;
mod ui;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}

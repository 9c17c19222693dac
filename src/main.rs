use std::{process, sync::Arc};

use clap::Parser;
use log::{error, info};
use tokio::sync::Mutex;

use notegraph::{App, Cli, Config, LocalFs, NoteGraph, Result, Synchronizer};

pub fn initialize_logger(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .format_module_path(true)
        .init();

    info!("Logger initialized");
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(notes_dir) = cli.notes_dir {
        config.notes_dir = notes_dir;
    }
    config.validate()?;

    let graph = NoteGraph::new(Some(config.notes_dir.clone()))
        .with_default_extension(config.default_extension.clone());
    let sync = Synchronizer::new(Arc::new(LocalFs), Arc::new(Mutex::new(graph)), config.clone())?;
    let app = App::new(Arc::new(sync), config, cli.verbose);
    app.run(cli.command).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initialize_logger(cli.verbose);
    info!("Application starting up");

    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    info!("Application shutting down");
}

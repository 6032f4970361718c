//! HTTP + push server command (`pipewright serve`).

use std::path::{Path, PathBuf};

use anyhow::Result;
use pipewright::config::PipewrightConfig;
use pipewright::workflow::server::{ServeOptions, start_server};

pub struct ServeArgs {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
    pub external_runner: bool,
}

pub async fn cmd_serve(project_dir: &Path, args: ServeArgs) -> Result<()> {
    let mut config = PipewrightConfig::load(project_dir)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.server.db_path = db_path;
    }
    config.validate()?;
    let runtime = config.resolve(project_dir);

    tracing::info!(
        primary_branch = %runtime.primary_branch,
        db = %runtime.db_path.display(),
        "starting server"
    );
    start_server(
        runtime,
        ServeOptions {
            dev_mode: args.dev,
            external_runner: args.external_runner,
        },
    )
    .await
}

use clap::Parser;
use model_sync::settings::DEFAULT_CONFIG_PATH;
use model_sync::{RunMode, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "model-sync", version, about = "Sync model artifacts from object storage into a model server")]
struct Cli {
    /// Settings file (YAML, JSON or TOML).
    #[arg(long, env = "MODEL_SYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Run the startup health check and exit 0 (healthy) or 1.
    #[arg(long, env = "MODEL_SYNC_HEALTH_CHECK")]
    health_check: bool,
    /// Run one sync cycle and exit.
    #[arg(long, env = "MODEL_SYNC_ONCE", conflicts_with = "health_check")]
    once: bool,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.health_check {
            RunMode::HealthCheckOnly
        } else if self.once {
            RunMode::Once
        } else {
            RunMode::Daemon
        }
    }

    /// Explicit path, else the default path if present, else env only.
    fn config_file(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            default.exists().then_some(default)
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match Settings::load(cli.config_file().as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("model-sync: {e}");
            return ExitCode::FAILURE;
        }
    };
    let level = settings.sync.level_filter().map(|l| l.to_string().to_lowercase()).unwrap_or_else(|_| "info".into());
    if let Err(e) = sync_core::init_tracing("model-sync", &level) {
        eprintln!("model-sync: tracing setup failed: {e:#}");
        return ExitCode::FAILURE;
    }
    info!(?settings, mode=?cli.mode(), "config_loaded");

    let shutdown = CancellationToken::new();
    tokio::spawn(sync_core::shutdown_signal(shutdown.clone()));

    match model_sync::run(settings, cli.mode(), shutdown).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error=?e, "model_sync_failed");
            ExitCode::FAILURE
        }
    }
}

//! runnerset: compute-engine-agnostic autoscaler for GitHub Actions
//! runner scale sets.
//!
//! Registers a runner scale set and autoscales strictly ephemeral runners
//! on a pluggable compute engine (Docker today, GCP Compute Engine VMs,
//! more planned). Configuration is read from a TOML file (`--config`) with
//! environment and CLI flag overrides for the common settings.

mod buildinfo;
mod config;
mod health;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use config::Config;
use runnerset_github::types::RunnerSetting;
use runnerset_github::{
    listener, ActionsClient, JitConfigIssuer, Listener, MessageSession, RunnerScaleSet,
    DEFAULT_RUNNER_GROUP, DEFAULT_RUNNER_GROUP_ID,
};
use runnerset_scaler::{Scaler, ScalerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "runnerset",
    version,
    about = "GitHub Actions runner scale set autoscaler with pluggable compute engines"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "runnerset.toml")]
    config: PathBuf,

    /// GitHub URL for scale set registration (e.g. https://github.com/org).
    #[arg(long)]
    url: Option<String>,

    /// Personal access token (alternative to a GitHub App).
    #[arg(long)]
    token: Option<String>,

    /// GitHub App client id.
    #[arg(long)]
    app_client_id: Option<String>,

    /// GitHub App installation id.
    #[arg(long)]
    app_installation_id: Option<i64>,

    /// GitHub App private key (PEM).
    #[arg(long)]
    app_private_key: Option<String>,

    /// Path to the GitHub App private key PEM file.
    #[arg(long)]
    app_private_key_path: Option<String>,

    /// Scale set name.
    #[arg(long)]
    name: Option<String>,

    /// Minimum number of runners.
    #[arg(long)]
    min_runners: Option<usize>,

    /// Maximum number of runners.
    #[arg(long)]
    max_runners: Option<usize>,

    /// Runner group name.
    #[arg(long)]
    runner_group: Option<String>,

    /// Log level (debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text, json).
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Merges set flags into the loaded configuration.
    fn apply_overrides(&self, cfg: &mut Config) {
        macro_rules! set {
            ($flag:expr, $target:expr) => {
                if let Some(value) = &$flag {
                    $target = value.clone();
                }
            };
        }
        set!(self.url, cfg.github.url);
        set!(self.token, cfg.github.token);
        set!(self.app_client_id, cfg.github.app.client_id);
        set!(self.app_private_key, cfg.github.app.private_key);
        set!(self.app_private_key_path, cfg.github.app.private_key_path);
        set!(self.name, cfg.scaleset.name);
        set!(self.runner_group, cfg.scaleset.runner_group);
        set!(self.log_level, cfg.logging.level);
        set!(self.log_format, cfg.logging.format);
        if let Some(id) = self.app_installation_id {
            cfg.github.app.installation_id = id;
        }
        if let Some(min) = self.min_runners {
            cfg.scaleset.min_runners = min;
        }
        if let Some(max) = self.max_runners {
            cfg.scaleset.max_runners = max;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::load(&cli.config).context("loading config")?;
    cli.apply_overrides(&mut cfg);
    cfg.validate().context("invalid configuration")?;

    telemetry::init_logging(&cfg.logging);
    tracing::info!(
        version = buildinfo::VERSION,
        commit = buildinfo::COMMIT,
        build_time = buildinfo::BUILD_TIME,
        config_file = %cli.config.display(),
        engine = cfg.enabled_engine(),
        scale_set = %cfg.scaleset.name,
        min_runners = cfg.scaleset.min_runners,
        max_runners = cfg.scaleset.max_runners,
        "configuration loaded"
    );

    run(cfg).await
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    telemetry::log_telemetry_target(&cfg.telemetry);
    let metrics_handle = telemetry::install_recorder();
    if cfg.prometheus.enable {
        tokio::spawn(health::serve(
            cfg.prometheus.port,
            cfg.enabled_engine(),
            metrics_handle,
            cancel.child_token(),
        ));
    }

    let client = Arc::new(
        ActionsClient::new(&cfg.github.url, cfg.credential()?)
            .context("creating scale-set client")?,
    );

    let runner_group_id = if cfg.scaleset.runner_group == DEFAULT_RUNNER_GROUP {
        DEFAULT_RUNNER_GROUP_ID
    } else {
        client
            .get_runner_group_by_name(&cancel, &cfg.scaleset.runner_group)
            .await
            .with_context(|| format!("looking up runner group {:?}", cfg.scaleset.runner_group))?
            .id
    };

    let scale_set = client
        .create_runner_scale_set(
            &cancel,
            &RunnerScaleSet {
                name: cfg.scaleset.name.clone(),
                runner_group_id,
                labels: cfg.build_labels(),
                runner_setting: RunnerSetting {
                    ephemeral: true,
                    disable_update: true,
                },
                ..Default::default()
            },
        )
        .await
        .context("creating runner scale set")?;

    tracing::info!(
        scale_set_id = scale_set.id,
        name = %scale_set.name,
        "runner scale set created"
    );

    // From here on, the scale set must be deleted on the way out even when
    // the root token is already cancelled, so cleanup runs detached.
    let result = run_scaler(&cfg, &cancel, &client, scale_set.id).await;

    let detached = CancellationToken::new();
    tracing::info!(scale_set_id = scale_set.id, "deleting runner scale set");
    if let Err(e) = client.delete_runner_scale_set(&detached, scale_set.id).await {
        tracing::error!(
            scale_set_id = scale_set.id,
            error = %e,
            "failed to delete runner scale set"
        );
    }

    result
}

async fn run_scaler(
    cfg: &Config,
    cancel: &CancellationToken,
    client: &Arc<ActionsClient>,
    scale_set_id: i64,
) -> anyhow::Result<()> {
    let engine = cfg
        .build_engine(cancel)
        .await
        .context("initializing engine")?;

    let owner = hostname();
    let session = MessageSession::open(Arc::clone(client), cancel, scale_set_id, &owner)
        .await
        .context("creating message session")?;

    let issuer: Arc<dyn JitConfigIssuer> = client.clone();
    let scaler = Arc::new(Scaler::new(ScalerConfig {
        scale_set_id,
        min_runners: cfg.scaleset.min_runners,
        max_runners: cfg.scaleset.max_runners,
        engine,
        issuer,
    }));

    tracing::info!("starting listener");
    let mut message_listener = Listener::new(session);
    let dyn_scaler: Arc<dyn listener::Scaler> = scaler.clone();
    let run_result = message_listener.run(cancel, dyn_scaler).await;

    // Teardown in order, all under a detached token: destroy the fleet,
    // then close the session.
    let detached = CancellationToken::new();
    scaler.shutdown(&detached).await;
    if let Err(e) = message_listener.close(&detached).await {
        tracing::warn!(error = %e, "failed to close message session");
    }

    match run_result {
        Ok(()) => {
            tracing::info!("shutting down gracefully");
            Ok(())
        }
        Err(e) => Err(e).context("listener"),
    }
}

/// Owner key for the message session: hostname, or a random id when the
/// hostname cannot be determined.
fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    let fallback = Uuid::new_v4().to_string();
    tracing::warn!(fallback = %fallback, "could not determine hostname, using random id");
    fallback
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::sync::mpsc::unbounded_channel;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
use config::DeployhookConfig;

mod deploy;
use deploy::{AuditLog, Deployer, Executor};

mod registry;
use registry::{webhook_path, Registry};

mod router;
mod utils;

mod webhooks;
use webhooks::DeploySender;

#[derive(Parser)]
#[command(version)]
struct Opts {
    /// Configuration file for deployhook
    #[arg(short, long)]
    config: PathBuf,
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let config = DeployhookConfig::load(&opts.config)?;

    let registry = Registry::new(config.repositories);
    for (identifier, repo) in registry.iter() {
        info!(
            "serving {} on POST {} (branch {}, script {}{}, secret {})",
            identifier,
            webhook_path(identifier),
            repo.branch,
            repo.deploy_script.display(),
            if repo.deploy_script.exists() {
                ""
            } else {
                ", missing"
            },
            if repo.secret.is_empty() { "unset" } else { "set" },
        );
    }

    let audit = AuditLog::new(config.audit_log);
    info!("recording deployments to {}", audit.path().display());
    let executor = Executor::new(
        config.deploy.interpreter,
        config.deploy.timeout_secs.map(Duration::from_secs),
    );
    let deployer = Arc::new(Deployer::new(
        executor,
        audit.clone(),
        config.deploy.serialize_per_repository,
    ));

    let (sender, receiver) = unbounded_channel();
    tokio::spawn(async move { deployer.run(receiver).await });

    let figment = rocket::Config::figment()
        .merge(("address", config.address))
        .merge(("port", config.port));
    let rocket = webhooks::mount(
        rocket::custom(figment),
        registry,
        audit,
        DeploySender(sender),
    );
    rocket
        .launch()
        .await
        .map(|_| ())
        .map_err(|err| anyhow::anyhow!(err))
}

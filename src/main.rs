use crate::cli::Cli;
use crate::notifier::SlackNotifier;
use crate::state::AppState;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

mod admission;
mod cli;
mod config;
mod image_reference;
mod matcher;
mod notifier;
mod secret_string;
mod state;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt::init();
    info!("Starting kube-image-bouncer {}", env!("CARGO_PKG_VERSION"));

    // reqwest and axum-server both pull in rustls; pin the process-wide crypto provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = config::resolve_config(&cli)?;
    info!(
        "Whitelisted namespaces: {:?}, whitelisted registries: {:?}",
        config.policy.whitelisted_namespaces, config.policy.whitelisted_registries
    );
    if !config.policy.restricts_registries() {
        info!("No registry whitelist configured, images from every registry are allowed");
    }

    let notifier = SlackNotifier::from_config(&config.notifier)?;
    let state = Arc::new(AppState::new(
        config.policy,
        notifier,
        config.notifier.timeout(),
    ));

    let app = webserver::create_app(state);
    webserver::serve(app, &config.tls, config.webserver.port).await?;

    Ok(())
}

use clap::Parser;
use std::path::PathBuf;

/// Every option can also be set through its environment variable. Options
/// given here override the values of the configuration file.
#[derive(Parser, Debug, Default)]
#[command(name = "kube-image-bouncer", version, about = "Validating admission webhook for container image policies")]
pub struct Cli {
    /// Path to an optional YAML configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// TLS certificate file (PEM)
    #[arg(long, env = "TLS_CERT_FILE")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long, env = "TLS_KEY_FILE")]
    pub tls_key: Option<PathBuf>,

    /// HTTPS port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Comma-separated namespaces exempted from the image policy
    #[arg(long, env = "WHITELIST_NAMESPACES")]
    pub namespace_whitelist: Option<String>,

    /// Comma-separated registry hosts images may be pulled from. Empty allows every registry
    #[arg(long, env = "WHITELIST_REGISTRIES")]
    pub registry_whitelist: Option<String>,

    /// Webhook URL receiving a message for every rejected pod
    #[arg(long, env = "WEBHOOK_URL", hide_env_values = true)]
    pub notifier_url: Option<String>,

    /// Upper bound for delivering a rejection notification
    #[arg(long, env = "NOTIFIER_TIMEOUT_SECONDS")]
    pub notifier_timeout_seconds: Option<u64>,
}

use std::convert::Infallible;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "kgend",
    about = "kgend — hands kubeadm join commands to hosts whose reverse DNS matches a pattern",
    version
)]
struct Cli {
    /// Use an HTTP request header to get the client IP. Useful behind a proxy.
    #[arg(long = "useHeader", env = "KGEN_USE_HEADER", value_parser = lenient_bool)]
    use_header: bool,
    /// Header carrying the client source IP when --useHeader is set
    #[arg(long, env = "KGEN_HEADER", default_value = "X-Forwarding-for")]
    header: String,
    /// Regex a reverse-DNS hostname of the client must match
    #[arg(long = "match", env = "KGEN_MATCH", default_value = "^.*$")]
    pattern: String,
    /// [ip]:port to accept HTTP requests on
    #[arg(long, env = "KGEN_ADDR", default_value = ":8000")]
    addr: String,
    /// Certificate key appended when a new control-plane node asks to join
    #[arg(long = "cert-key", env = "KGEN_CERT")]
    cert_key: Option<String>,
    /// kubeadm binary used to create bootstrap tokens
    #[arg(long, env = "KGEN_KUBEADM", default_value = "kubeadm")]
    kubeadm: PathBuf,
    /// Admin kubeconfig passed to kubeadm (default: kubeadm's own default)
    #[arg(long, env = "KGEN_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
    /// Log level: error, warn, info, debug, verbose
    #[arg(long, env = "KGEN_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Unrecognised spellings mean "off" rather than a startup error.
fn lenient_bool(value: &str) -> Result<bool, Infallible> {
    Ok(kgen_server::parse_env_bool(value).unwrap_or(false))
}

impl Cli {
    fn effective_log_level(&self) -> String {
        if self.log_level.eq_ignore_ascii_case("verbose") {
            "debug".to_owned()
        } else {
            self.log_level.clone()
        }
    }

    fn into_server_config(self) -> kgen_server::ServerConfig {
        kgen_server::ServerConfig {
            listen_addr: self.addr,
            use_header: self.use_header,
            header: self.header,
            pattern: self.pattern,
            cert_key: self.cert_key,
            kubeadm: self.kubeadm,
            kubeconfig: self.kubeconfig,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.effective_log_level()))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting kgend");

    kgen_server::run(cli.into_server_config()).await
}

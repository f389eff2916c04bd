use std::path::PathBuf;

use {
    clap::{Parser, ValueEnum},
    firstcontact_config::{FirstContactConfig, TransportKind},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Native,
    Bridge,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Native => Self::Native,
            TransportArg::Bridge => Self::Bridge,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "firstcontact",
    version,
    about = "Keeps a WhatsApp session alive and greets every new contact once"
)]
struct Cli {
    /// Address to bind the HTTP listener to (overrides `server.bind`).
    #[arg(long, env = "FIRSTCONTACT_BIND")]
    bind: Option<String>,

    /// HTTP port (overrides `server.port`).
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// WhatsApp transport (overrides `transport.kind`).
    #[arg(long, value_enum, env = "FIRSTCONTACT_TRANSPORT")]
    transport: Option<TransportArg>,

    /// Bridge WebSocket URL (overrides `transport.bridge_url`).
    #[arg(long, env = "FIRSTCONTACT_BRIDGE_URL")]
    bridge_url: Option<String>,

    /// Directory holding `firstcontact.toml` and `settings.toml`.
    #[arg(long, env = "FIRSTCONTACT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut FirstContactConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(kind) = self.transport {
            config.transport.kind = Some(kind.into());
        }
        if let Some(url) = &self.bridge_url {
            config.transport.bridge_url = url.clone();
        }
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "firstcontact starting");

    if let Some(dir) = &cli.config_dir {
        firstcontact_config::set_config_dir(dir.clone());
    }
    let mut config = firstcontact_config::discover_and_load();
    cli.apply_overrides(&mut config);

    firstcontact_gateway::server::start_gateway(config).await
}

mod lanproxy;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lanproxy",
    version,
    about = "lanproxy client - expose services behind NAT through a relay host"
)]
struct Cli {
    /// Path to a config file (.toml/.yaml/.yml). If omitted, uses LANPROXY_CONFIG; then auto-detects lanproxy.toml > lanproxy.yaml > lanproxy.yml from CWD; then the OS default path (Linux: /etc/lanproxy/lanproxy.toml). A missing discovered file is not an error.
    #[arg(long, env = "LANPROXY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Client key issued by the relay.
    #[arg(short = 'k', long = "client-key", env = "LANPROXY_CLIENT_KEY")]
    client_key: Option<String>,

    /// Relay host.
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// Relay port (default 4900).
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Connect to the relay over TLS.
    #[arg(long = "ssl", num_args = 0..=1, default_missing_value = "true")]
    ssl: Option<bool>,

    /// PEM certificate bundle used to verify the relay.
    #[arg(long = "cer")]
    cer: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG wins when set.
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = lanproxy::config::Overrides {
        client_key: cli.client_key,
        server_host: cli.server,
        server_port: cli.port,
        ssl: cli.ssl,
        cert_file: cli.cer,
        log_level: cli.log_level,
    };
    lanproxy::run(cli.config, overrides).await
}

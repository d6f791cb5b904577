//! Gateway binary entry point.
//!
//! Serves JWE-encrypted IPFS documents over SCGI, answers single CGI
//! requests, or retrieves one document to a file.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use monas_gateway::config::GatewayConfig;
use monas_gateway::infrastructure::KeyStore;
use monas_gateway::presentation::cgi;
use monas_gateway::Gateway;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Gateway CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "monas-gateway")]
#[command(about = "Monas Gateway - Encrypted IPFS documents over SCGI/CGI")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// IPFS RPC API address (multiaddr or http URL).
    #[arg(long, global = true)]
    ipfs_api: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve SCGI requests until interrupted.
    ServeScgi {
        /// File with one JWK per line.
        #[arg(long)]
        keys_file: Option<PathBuf>,

        /// Unix socket to listen on.
        #[arg(long)]
        socket_file: Option<PathBuf>,

        /// TCP address to listen on instead of a unix socket.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Answer one CGI request, taking the key ID from PATH_INFO.
    HandleCgi {
        /// File with one JWK per line.
        #[arg(long)]
        keys_file: Option<PathBuf>,
    },

    /// Retrieve and decrypt the document of one key.
    Fetch {
        /// File with one JWK per line.
        #[arg(long)]
        keys_file: Option<PathBuf>,

        /// Key ID to retrieve.
        #[arg(long)]
        kid: String,

        /// Where to write the plaintext.
        #[arg(long, default_value = "/dev/stdout")]
        out_file: PathBuf,
    },

    /// Decrypt the document described by a single standalone key file.
    Decrypt {
        /// JWK file holding one key record.
        #[arg(long)]
        key: PathBuf,

        /// Where to write the plaintext.
        #[arg(long, default_value = "/dev/stdout")]
        out_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout is the response channel in CGI mode.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.global.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::ServeScgi {
            keys_file,
            socket_file,
            listen,
        } => {
            let mut config = load_config(&cli.global, keys_file)?;
            if let Some(socket_file) = socket_file {
                config.scgi.socket = socket_file;
            }
            if let Some(listen) = listen {
                config.scgi.listen = Some(listen);
            }

            tracing::info!("Starting Monas Gateway");
            let gateway = Gateway::new(config)
                .await
                .context("Failed to start gateway")?;
            gateway.serve_scgi(shutdown_signal()).await?;
        }
        Command::HandleCgi { keys_file } => {
            let mut stdout = tokio::io::stdout();
            match cgi_gateway(&cli.global, keys_file).await {
                Ok(gateway) => {
                    let key_id = cgi::key_id_from_env();
                    cgi::handle(gateway.service(), key_id.as_deref(), &mut stdout).await?;
                }
                Err(e) => {
                    tracing::error!("Failed to start gateway: {:#}", e);
                    cgi::write_startup_failure(&mut stdout, &e).await?;
                }
            }
        }
        Command::Fetch {
            keys_file,
            kid,
            out_file,
        } => {
            let config = load_config(&cli.global, keys_file)?;
            let gateway = Gateway::new(config)
                .await
                .context("Failed to start gateway")?;
            let document = gateway
                .service()
                .retrieve(&kid)
                .await
                .with_context(|| format!("Failed to retrieve key `{kid}`"))?;
            write_output(&out_file, &document.body).await?;
            tracing::info!("Wrote {} bytes of {}", document.body.len(), document.mime);
        }
        Command::Decrypt { key, out_file } => {
            let config = load_config(&cli.global, None)?;
            let record = KeyStore::load_single_file(&key)
                .with_context(|| format!("Failed to load key from {}", key.display()))?;
            let gateway = Gateway::with_key_store(config, KeyStore::default())
                .await
                .context("Failed to start gateway")?;
            let document = gateway
                .service()
                .retrieve_record(&record)
                .await
                .with_context(|| format!("Failed to decrypt document of key `{}`", record.id()))?;
            write_output(&out_file, &document.body).await?;
            tracing::info!("Wrote {} bytes of {}", document.body.len(), document.mime);
        }
    }

    Ok(())
}

/// Configuration file (or defaults) with command-line overrides applied.
fn load_config(global: &GlobalArgs, keys_file: Option<PathBuf>) -> Result<GatewayConfig> {
    let mut config = match &global.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    if let Some(api) = &global.ipfs_api {
        config.ipfs.api = api.clone();
    }
    if let Some(keys_file) = keys_file {
        config.keys.file = keys_file;
    }

    Ok(config)
}

async fn cgi_gateway(global: &GlobalArgs, keys_file: Option<PathBuf>) -> Result<Gateway> {
    let config = load_config(global, keys_file)?;
    Gateway::new(config).await
}

async fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

use std::{error::Error, fs, path::PathBuf, process, time::Duration};

use clap::Parser;
use log::{error, info};
use objproxy::{
    AesGcmCrypter, CryptoKey, FileStorage, ProxyServer, ServerConfig,
    protocol::DEFAULT_SOCKET_PATH,
    storage::{
        RetryPolicy,
        retry::{DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_LIMIT},
    },
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Unix socket to listen on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    /// Directory holding stored objects
    #[arg(long)]
    storage: PathBuf,
    /// Key file enabling encrypted puts and decrypted cats
    #[arg(long)]
    key_file: Option<PathBuf>,
    /// Backend failures tolerated per read
    #[arg(long, default_value_t = DEFAULT_RETRY_LIMIT)]
    retry_limit: usize,
    /// Pause after a failed backend open, in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_BACKOFF.as_millis() as u64)]
    retry_backoff_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let crypter = match &cli.key_file {
        Some(path) => Some(AesGcmCrypter::new(CryptoKey::load(path)?)),
        None => None,
    };
    let storage = FileStorage::open(&cli.storage)?;
    let config = ServerConfig {
        socket_path: cli.socket.clone(),
        retry: RetryPolicy::new(cli.retry_limit, Duration::from_millis(cli.retry_backoff_ms)),
    };

    let socket = cli.socket.clone();
    ctrlc::set_handler(move || {
        info!("shutting down");
        if let Err(e) = fs::remove_file(&socket) {
            error!("failed to remove socket {}: {e}", socket.display());
        }
        process::exit(0);
    })?;

    let server = ProxyServer::new(config, storage, crypter);
    let aborted = server.abort_failed_uploads()?;
    if aborted > 0 {
        info!("aborted {aborted} failed uploads");
    }

    server.listen()?;
    Ok(())
}

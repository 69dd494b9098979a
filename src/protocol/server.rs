use std::{
    fs, io,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use log::{debug, error, info, warn};

use crate::{
    crypt::Crypter,
    storage::{RetryPolicy, StorageError, StorageInteractor},
};

use super::handle_connection;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/objproxy.sock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            retry: RetryPolicy::default(),
        }
    }
}

/// Accepts client connections on a unix socket and serves each on its own thread.
pub struct ProxyServer<S, C> {
    config: ServerConfig,
    storage: Arc<S>,
    crypter: Arc<C>,
}

impl<S, C> ProxyServer<S, C>
where
    S: StorageInteractor + 'static,
    C: Crypter + 'static,
{
    pub fn new(config: ServerConfig, storage: S, crypter: C) -> Self {
        Self {
            config,
            storage: Arc::new(storage),
            crypter: Arc::new(crypter),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Aborts uploads left unfinished by a previous run. Returns how many were aborted.
    pub fn abort_failed_uploads(&self) -> Result<usize, StorageError> {
        let failed = self.storage.list_failed_multipart_uploads()?;
        let mut aborted = 0;
        for (key, upload_id) in failed {
            match self.storage.abort_multipart_upload(&key, &upload_id) {
                Ok(()) => {
                    info!("aborted failed upload '{key}' ({upload_id})");
                    aborted += 1;
                }
                Err(e) => warn!("failed to abort upload '{key}' ({upload_id}): {e}"),
            }
        }
        Ok(aborted)
    }

    /// Binds the socket, replacing a stale socket file, and serves connections forever.
    pub fn listen(self) -> io::Result<()> {
        match fs::remove_file(&self.config.socket_path) {
            Ok(()) => debug!("removed stale socket {}", self.config.socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&self.config.socket_path)?;
        self.serve(listener)
    }

    /// Serves connections from an already bound listener.
    pub fn serve(self, listener: UnixListener) -> io::Result<()> {
        info!("listening at {:?}", listener.local_addr()?);

        for (id, stream) in listener.incoming().enumerate() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to accept connection: {e}");
                    continue;
                }
            };
            info!("accepted connection {id}");

            let storage = Arc::clone(&self.storage);
            let crypter = Arc::clone(&self.crypter);
            let policy = self.config.retry;
            let spawned = thread::Builder::new()
                .name(format!("objproxy-conn-{id}"))
                .spawn(move || {
                    if let Err(e) =
                        handle_connection(stream, storage.as_ref(), crypter.as_ref(), policy)
                    {
                        debug!("connection {id} finished with error: {e}");
                    }
                });
            if let Err(e) = spawned {
                error!("failed to spawn handler for connection {id}: {e}");
            }
        }
        Ok(())
    }
}

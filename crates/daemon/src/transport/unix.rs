//! Unix domain socket transport.
//!
//! Each accepted connection is served on its own task with newline-delimited
//! JSON in both directions.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use super::connection::serve_lines;
use super::TransportKind;
use crate::router::MessageRouter;

/// A listener bound to a Unix socket path.
pub struct UnixServer {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixServer {
    /// Bind the server to the specified socket path.
    ///
    /// Missing parent directories are created and a stale socket file at the
    /// path is removed first. Any other kind of file at the path is left alone
    /// and binding fails.
    pub fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(path)?;
                tracing::debug!(path = %path.display(), "Removed stale socket");
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "Unix socket listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until shutdown, serving each on its own task.
    pub async fn run(
        self,
        router: Arc<MessageRouter>,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> Result<(), io::Error> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept Unix connection");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        if let Err(e) = serve_lines(
                            read_half,
                            write_half,
                            router,
                            TransportKind::Unix,
                            queue_capacity,
                            shutdown,
                        )
                        .await
                        {
                            tracing::debug!(error = %e, "Unix connection ended with error");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }
    }
}

//! The socket the helpers send dialog requests to.
//!
//! The helpers connect to a fixed path, so the daemon binds it itself. The
//! directory is private to the user, and only a socket left over from an
//! earlier daemon is ever removed from the path.

use std::future::Future;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;

use prompt_bridge_core::config::default_socket_path;
use prompt_bridge_core::{SocketError, SocketProvider};
use tokio::net::UnixListener;
use tracing::{debug, info};

/// Dialog socket at a fixed path.
pub struct DialogSocket {
    path: PathBuf,
}

impl DialogSocket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn bind(&self) -> Result<UnixListener, SocketError> {
        if let Some(dir) = self.path.parent() {
            prepare_dir(dir).map_err(SocketError::DirectoryCreationFailed)?;
        }
        self.remove_stale()?;

        let listener = UnixListener::bind(&self.path).map_err(SocketError::BindFailed)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .map_err(SocketError::BindFailed)?;

        info!(path = %self.path.display(), "Listening for dialog requests");
        Ok(listener)
    }

    fn remove_stale(&self) -> Result<(), SocketError> {
        let metadata = match std::fs::symlink_metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SocketError::BindFailed(e)),
        };
        if !metadata.file_type().is_socket() {
            return Err(SocketError::NotASocket(self.path.clone()));
        }
        std::fs::remove_file(&self.path).map_err(SocketError::BindFailed)?;
        debug!(path = %self.path.display(), "Removed stale dialog socket");
        Ok(())
    }
}

/// Create `dir` owner-only. An existing directory is left as it is.
fn prepare_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    debug!(path = %dir.display(), "Created socket directory");
    Ok(())
}

impl Default for DialogSocket {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl SocketProvider for DialogSocket {
    fn listen(&self) -> Pin<Box<dyn Future<Output = Result<UnixListener, SocketError>> + Send + '_>> {
        Box::pin(self.bind())
    }

    fn socket_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn helper_can_connect_to_private_socket() {
        let runtime_dir = tempfile::tempdir().unwrap();
        let path = runtime_dir.path().join("prompt-bridge").join("socket");

        let listener = DialogSocket::new(&path).listen().await.unwrap();
        assert_eq!(mode(path.parent().unwrap()), 0o700);
        assert_eq!(mode(&path), 0o600);

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            request
        });
        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        client.write_all(b"{\"prompt\":\"p\"}\0").await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(accept.await.unwrap(), b"{\"prompt\":\"p\"}\0");
    }

    #[tokio::test]
    async fn existing_directory_keeps_its_mode() {
        let runtime_dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(runtime_dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = runtime_dir.path().join("socket");

        let _listener = DialogSocket::new(&path).listen().await.unwrap();
        assert_eq!(mode(runtime_dir.path()), 0o755);
    }

    #[tokio::test]
    async fn socket_left_by_dead_daemon_is_replaced() {
        let runtime_dir = tempfile::tempdir().unwrap();
        let path = runtime_dir.path().join("socket");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(tokio::net::UnixStream::connect(&path).await.is_err());

        let _listener = DialogSocket::new(&path).listen().await.unwrap();
        assert!(tokio::net::UnixStream::connect(&path).await.is_ok());
    }

    #[tokio::test]
    async fn regular_file_at_path_is_not_removed() {
        let runtime_dir = tempfile::tempdir().unwrap();
        let path = runtime_dir.path().join("socket");
        std::fs::write(&path, "not a socket").unwrap();

        let result = DialogSocket::new(&path).listen().await;
        assert!(matches!(result, Err(SocketError::NotASocket(p)) if p == path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not a socket");
    }

    #[test]
    fn default_path_is_per_user() {
        let socket = DialogSocket::default();
        let path = socket.socket_path().unwrap();
        assert!(path.ends_with("socket"));
        assert!(path.to_string_lossy().contains("prompt-bridge"));
    }
}

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Default number of files copied at once.
pub const DEFAULT_COPY_CONCURRENCY: usize = 16;

/// Errors from copying a GPG home.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("Failed to copy {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Copy task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IsolationError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| IsolationError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Find the user's GPG home from the process environment.
pub async fn discover_native_home() -> std::io::Result<Option<PathBuf>> {
    discover_native_home_in(
        std::env::var_os("GNUPGHOME"),
        std::env::var_os("APPDATA"),
        dirs::home_dir(),
    )
    .await
}

/// Find the GPG home: `GNUPGHOME` as given, else `%APPDATA%\gnupg` or
/// `~/.gnupg` if they are directories.
pub async fn discover_native_home_in(
    gnupghome: Option<OsString>,
    appdata: Option<OsString>,
    home: Option<PathBuf>,
) -> std::io::Result<Option<PathBuf>> {
    if let Some(gnupghome) = gnupghome.filter(|value| !value.is_empty()) {
        return Ok(Some(PathBuf::from(gnupghome)));
    }

    let candidates = [
        appdata
            .filter(|value| !value.is_empty())
            .map(|dir| PathBuf::from(dir).join("gnupg")),
        home.map(|dir| dir.join(".gnupg")),
    ];
    for candidate in candidates.into_iter().flatten() {
        if is_directory(&candidate).await? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Missing paths and paths through a non-directory are not directories;
/// any other failure is an error.
async fn is_directory(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(false),
        Err(e) => Err(e),
    }
}

/// A private copy of a GPG home, removed when dropped.
#[derive(Debug)]
pub struct IsolatedHome {
    dir: TempDir,
}

impl IsolatedHome {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl From<TempDir> for IsolatedHome {
    fn from(dir: TempDir) -> Self {
        Self { dir }
    }
}

/// Copies a GPG home into a fresh owner-only directory.
#[derive(Debug, Clone)]
pub struct GpgHomeIsolator {
    root: PathBuf,
    concurrency: usize,
}

impl GpgHomeIsolator {
    /// Copies go into new directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            concurrency: DEFAULT_COPY_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Copy `source` recursively.
    ///
    /// Directories are created before anything inside them; the files of one
    /// directory are copied concurrently. Symlinks, sockets and other special
    /// files are skipped. Any I/O error aborts the copy and removes what was
    /// copied so far.
    pub async fn clone_home(&self, source: &Path) -> Result<IsolatedHome, IsolationError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(IsolationError::io(&self.root))?;
        let dir = tempfile::Builder::new()
            .prefix("gnupg-")
            .tempdir_in(&self.root)
            .map_err(IsolationError::io(&self.root))?;
        set_mode(dir.path(), 0o700).await?;
        let home = IsolatedHome::from(dir);

        debug!(
            source = %source.display(),
            target = %home.path().display(),
            "Cloning GPG home"
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut pending = VecDeque::from([(source.to_path_buf(), home.path().to_path_buf())]);

        while let Some((from_dir, to_dir)) = pending.pop_front() {
            let mut entries = tokio::fs::read_dir(&from_dir)
                .await
                .map_err(IsolationError::io(&from_dir))?;
            let mut copies = JoinSet::new();

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(IsolationError::io(&from_dir))?
            {
                let from = entry.path();
                let to = to_dir.join(entry.file_name());
                let file_type = entry.file_type().await.map_err(IsolationError::io(&from))?;

                if file_type.is_dir() {
                    create_private_dir(&to).await?;
                    pending.push_back((from, to));
                } else if file_type.is_file() {
                    let permits = Arc::clone(&permits);
                    copies.spawn(async move {
                        let _permit = permits.acquire_owned().await;
                        copy_private_file(&from, &to).await
                    });
                } else {
                    debug!(path = %from.display(), "Skipping special file");
                }
            }

            while let Some(copied) = copies.join_next().await {
                copied??;
            }
        }

        Ok(home)
    }
}

async fn create_private_dir(path: &Path) -> Result<(), IsolationError> {
    tokio::fs::DirBuilder::new()
        .mode(0o700)
        .create(path)
        .await
        .map_err(IsolationError::io(path))
}

async fn copy_private_file(from: &Path, to: &Path) -> Result<(), IsolationError> {
    let mut reader = tokio::fs::File::open(from)
        .await
        .map_err(IsolationError::io(from))?;
    let mut writer = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(to)
        .await
        .map_err(IsolationError::io(to))?;
    tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(IsolationError::io(to))?;
    Ok(())
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), IsolationError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(IsolationError::io(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn populate(root: &Path) {
        std::fs::write(root.join("pubring.kbx"), b"public keys").unwrap();
        std::fs::write(root.join("trustdb.gpg"), vec![7u8; 70_000]).unwrap();
        std::fs::create_dir_all(root.join("private-keys-v1.d/nested")).unwrap();
        std::fs::write(root.join("private-keys-v1.d/ABCD.key"), b"secret key").unwrap();
        std::fs::write(root.join("private-keys-v1.d/nested/deep"), b"deep").unwrap();
        std::fs::create_dir(root.join("empty")).unwrap();
    }

    fn relative_files(root: &Path) -> Vec<(PathBuf, Option<Vec<u8>>)> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                let ty = entry.file_type().unwrap();
                if ty.is_dir() {
                    out.push((rel, None));
                    stack.push(path);
                } else if ty.is_file() {
                    out.push((rel, Some(std::fs::read(&path).unwrap())));
                }
            }
        }
        out.sort();
        out
    }

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn clone_copies_tree_byte_for_byte() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        populate(source.path());

        let home = GpgHomeIsolator::new(scratch.path())
            .with_concurrency(2)
            .clone_home(source.path())
            .await
            .unwrap();

        assert_eq!(relative_files(source.path()), relative_files(home.path()));
        assert!(home.path().starts_with(scratch.path()));
    }

    #[tokio::test]
    async fn clone_is_owner_only() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        populate(source.path());
        std::fs::set_permissions(
            source.path().join("pubring.kbx"),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let home = GpgHomeIsolator::new(scratch.path())
            .clone_home(source.path())
            .await
            .unwrap();

        assert_eq!(mode(home.path()), 0o700);
        assert_eq!(mode(&home.path().join("private-keys-v1.d")), 0o700);
        assert_eq!(mode(&home.path().join("private-keys-v1.d/nested")), 0o700);
        assert_eq!(mode(&home.path().join("pubring.kbx")), 0o600);
    }

    #[tokio::test]
    async fn clone_skips_symlinks_and_sockets() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("gpg.conf"), b"use-agent").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", source.path().join("link")).unwrap();
        let _socket = std::os::unix::net::UnixListener::bind(source.path().join("S.gpg-agent")).unwrap();

        let home = GpgHomeIsolator::new(scratch.path())
            .clone_home(source.path())
            .await
            .unwrap();

        assert!(home.path().join("gpg.conf").exists());
        assert!(!home.path().join("link").exists());
        assert!(!home.path().join("S.gpg-agent").exists());
    }

    #[tokio::test]
    async fn clone_is_removed_on_drop() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        populate(source.path());

        let home = GpgHomeIsolator::new(scratch.path())
            .clone_home(source.path())
            .await
            .unwrap();
        let path = home.path().to_path_buf();
        drop(home);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn clone_creates_missing_root() {
        let source = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("not/yet");

        let home = GpgHomeIsolator::new(&root)
            .clone_home(source.path())
            .await
            .unwrap();
        assert!(home.path().starts_with(&root));
    }

    #[tokio::test]
    async fn clone_of_missing_source_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let result = GpgHomeIsolator::new(scratch.path())
            .clone_home(&scratch.path().join("missing"))
            .await;
        assert!(matches!(result, Err(IsolationError::Io { .. })));
    }

    #[tokio::test]
    async fn gnupghome_wins_without_probing() {
        let found = discover_native_home_in(
            Some("/does/not/exist".into()),
            None,
            Some(PathBuf::from("/home/u")),
        )
        .await
        .unwrap();
        assert_eq!(found, Some(PathBuf::from("/does/not/exist")));
    }

    #[tokio::test]
    async fn appdata_then_home_directory() {
        let appdata = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join(".gnupg")).unwrap();

        let found = discover_native_home_in(
            Some(OsString::new()),
            Some(appdata.path().into()),
            Some(home.path().to_path_buf()),
        )
        .await
        .unwrap();
        assert_eq!(found, Some(home.path().join(".gnupg")));

        std::fs::create_dir(appdata.path().join("gnupg")).unwrap();
        let found = discover_native_home_in(None, Some(appdata.path().into()), Some(home.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(found, Some(appdata.path().join("gnupg")));
    }

    #[tokio::test]
    async fn files_and_missing_paths_are_not_homes() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join(".gnupg"), b"not a dir").unwrap();
        let appdata = home.path().join(".gnupg"); // a file, so appdata/gnupg is ENOTDIR

        let found = discover_native_home_in(None, Some(appdata.into()), Some(home.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(found, None);

        let found = discover_native_home_in(None, None, None).await.unwrap();
        assert_eq!(found, None);
    }
}

use std::ffi::OsString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::GpgError;

/// Descriptor gpg reads the passphrase from.
pub const PASSPHRASE_FD: RawFd = 3;

const MAX_TEXT_FILE_BUSY_RETRIES: u32 = 5;
const TEXT_FILE_BUSY_ERRNO: i32 = libc::ETXTBSY;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Termination::Exited(code),
            (None, Some(signal)) => Termination::Signaled(signal),
            (None, None) => Termination::Exited(1),
        }
    }
}

/// Everything a finished gpg run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn new(termination: Termination, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            termination,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    /// The exit code to report; 1 for a signal.
    pub fn exit_code(&self) -> i32 {
        match self.termination {
            Termination::Exited(code) => code,
            Termination::Signaled(_) => 1,
        }
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        String::from_utf8_lossy(&self.stderr).contains(needle)
    }
}

/// One gpg run: program, arguments, environment and input.
pub struct GpgInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    homedir: Option<PathBuf>,
    env: Vec<(String, OsString)>,
    passphrase: Option<SecretString>,
    stdin: Arc<[u8]>,
}

impl std::fmt::Debug for GpgInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpgInvocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("homedir", &self.homedir)
            .field("env", &self.env)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .field("stdin_len", &self.stdin.len())
            .finish()
    }
}

impl GpgInvocation {
    /// `args` are the caller's own arguments, passed through unchanged.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, stdin: Arc<[u8]>) -> Self {
        Self {
            program: program.into(),
            args,
            homedir: None,
            env: Vec::new(),
            passphrase: None,
            stdin,
        }
    }

    pub fn with_homedir(mut self, homedir: impl Into<PathBuf>) -> Self {
        self.homedir = Some(homedir.into());
        self
    }

    /// Set a variable on top of the inherited environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `passphrase` on [`PASSPHRASE_FD`].
    pub fn with_passphrase(mut self, passphrase: SecretString) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn homedir(&self) -> Option<&Path> {
        self.homedir.as_deref()
    }

    pub fn env(&self) -> &[(String, OsString)] {
        &self.env
    }

    pub fn has_passphrase(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Full argument list: fixed non-interactive flags, then our own, then
    /// the caller's.
    pub fn arguments(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["--batch", "--no-tty", "--yes"]
            .iter()
            .map(OsString::from)
            .collect();
        if let Some(homedir) = &self.homedir {
            args.push("--homedir".into());
            args.push(homedir.into());
        }
        if self.passphrase.is_some() {
            args.push("--passphrase-fd".into());
            args.push(PASSPHRASE_FD.to_string().into());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Run gpg to completion, collecting its output.
pub async fn run_gpg(invocation: &GpgInvocation) -> Result<ProcessOutput, GpgError> {
    let mut command = Command::new(&invocation.program);
    command
        .args(invocation.arguments())
        .envs(invocation.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // The read end is held until after spawn so the child inherits it.
    let passphrase_pipe = if invocation.passphrase.is_some() {
        Some(attach_passphrase(&mut command)?)
    } else {
        None
    };

    debug!(
        program = %invocation.program.display(),
        args = ?invocation.arguments(),
        "Running gpg"
    );
    let mut child = spawn_retrying(&mut command)
        .await
        .map_err(|source| GpgError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
    let passphrase_writer = passphrase_pipe.map(|(reader, writer)| {
        drop(reader);
        writer
    });

    let stdin = child.stdin.take();
    let (written, passed, output) = tokio::join!(
        write_input(stdin, &invocation.stdin),
        write_passphrase(passphrase_writer, invocation.passphrase.as_ref()),
        child.wait_with_output()
    );
    if let Err(e) = written {
        debug!(error = %e, "gpg did not read all of its input");
    }
    if let Err(e) = passed {
        debug!(error = %e, "gpg did not read the passphrase");
    }
    let output = output?;

    let output = ProcessOutput::new(output.status.into(), output.stdout, output.stderr);
    trace!(stdout_len = output.stdout.len(), "gpg stdout");
    trace!(stderr = %String::from_utf8_lossy(&output.stderr), "gpg stderr");
    debug!(termination = ?output.termination, "gpg finished");
    Ok(output)
}

async fn write_input(stdin: Option<ChildStdin>, input: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    stdin.write_all(input).await?;
    stdin.shutdown().await
}

/// Spawn `command`, retrying while the executable is still being written.
pub(crate) async fn spawn_retrying(command: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(error)
                if error.raw_os_error() == Some(TEXT_FILE_BUSY_ERRNO)
                    && attempt < MAX_TEXT_FILE_BUSY_RETRIES =>
            {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Create the passphrase pipe and arrange for the child to see its read end
/// as [`PASSPHRASE_FD`]. Returns the parent's read and write ends.
fn attach_passphrase(command: &mut Command) -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (reader, writer) = cloexec_pipe()?;

    let fd = reader.as_raw_fd();
    // SAFETY: the closure only calls async-signal-safe functions.
    unsafe {
        command.pre_exec(move || {
            if fd == PASSPHRASE_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(fd, PASSPHRASE_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok((reader, writer))
}

/// Write the passphrase line once gpg is running, then close the pipe.
///
/// A passphrase larger than the pipe buffer only fits while gpg reads it.
async fn write_passphrase(writer: Option<OwnedFd>, passphrase: Option<&SecretString>) -> std::io::Result<()> {
    let (Some(writer), Some(passphrase)) = (writer, passphrase) else {
        return Ok(());
    };
    let mut line = Zeroizing::new(Vec::with_capacity(passphrase.expose_secret().len() + 1));
    line.extend_from_slice(passphrase.expose_secret().as_bytes());
    line.push(b'\n');

    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        std::fs::File::from(writer).write_all(&line)
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

fn cloexec_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds has room for the two descriptors pipe writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: pipe succeeded, so both descriptors are open and ours.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&reader, &writer] {
        // SAFETY: fd is a valid open descriptor.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok((reader, writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn input(bytes: &[u8]) -> Arc<[u8]> {
        Arc::from(bytes)
    }

    #[test]
    fn arguments_are_ordered() {
        let invocation = GpgInvocation::new(
            "gpg",
            vec!["--status-fd=2".into(), "-bsau".into(), "KEY".into()],
            input(b""),
        )
        .with_homedir("/home/u/.gnupg")
        .with_passphrase(SecretString::from("p".to_string()));

        let args: Vec<String> = invocation
            .arguments()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(
            args,
            vec![
                "--batch",
                "--no-tty",
                "--yes",
                "--homedir",
                "/home/u/.gnupg",
                "--passphrase-fd",
                "3",
                "--status-fd=2",
                "-bsau",
                "KEY"
            ]
        );
    }

    #[test]
    fn plain_arguments_only_add_batch_flags() {
        let invocation = GpgInvocation::new("gpg", vec!["--version".into()], input(b""));
        assert_eq!(
            invocation.arguments(),
            vec![
                OsString::from("--batch"),
                OsString::from("--no-tty"),
                OsString::from("--yes"),
                OsString::from("--version")
            ]
        );
    }

    #[test]
    fn debug_hides_passphrase() {
        let invocation =
            GpgInvocation::new("gpg", vec![], input(b"")).with_passphrase(SecretString::from("hunter2".to_string()));
        let debug = format!("{:?}", invocation);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn exit_code_for_signal_is_one() {
        let output = ProcessOutput::new(Termination::Signaled(9), b"".to_vec(), b"".to_vec());
        assert_eq!(output.exit_code(), 1);
        assert!(!output.success());
        assert_eq!(ProcessOutput::new(Termination::Exited(2), vec![], vec![]).exit_code(), 2);
    }

    #[tokio::test]
    async fn run_replays_stdin_and_collects_output() {
        let dir = tempfile::tempdir().unwrap();
        let gpg = script(dir.path(), "gpg", "cat; echo \"args: $*\" >&2; exit 3");

        let output = run_gpg(&GpgInvocation::new(gpg, vec!["-s".into()], input(b"payload")))
            .await
            .unwrap();

        assert_eq!(output.termination, Termination::Exited(3));
        assert_eq!(output.stdout, b"payload");
        assert!(output.stderr_contains("args: --batch --no-tty --yes -s"));
    }

    #[tokio::test]
    async fn run_sets_extra_environment() {
        let dir = tempfile::tempdir().unwrap();
        let gpg = script(dir.path(), "gpg", "printf '%s' \"$GPG_AGENT_INFO\"");

        let invocation =
            GpgInvocation::new(gpg, vec![], input(b"")).with_env("GPG_AGENT_INFO", "/run/agent:1:1");
        let output = run_gpg(&invocation).await.unwrap();
        assert_eq!(output.stdout, b"/run/agent:1:1");
    }

    #[tokio::test]
    async fn passphrase_is_readable_on_fd_3() {
        let dir = tempfile::tempdir().unwrap();
        let gpg = script(dir.path(), "gpg", "read pass <&3; printf '%s' \"$pass\"");

        let invocation = GpgInvocation::new(gpg, vec![], input(b""))
            .with_passphrase(SecretString::from("correct horse".to_string()));
        let output = run_gpg(&invocation).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, b"correct horse");
    }

    #[tokio::test]
    async fn passphrase_larger_than_pipe_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let gpg = script(dir.path(), "gpg", "wc -c <&3");

        let passphrase = "x".repeat(256 * 1024);
        let invocation = GpgInvocation::new(gpg, vec![], input(b""))
            .with_passphrase(SecretString::from(passphrase));
        let output = tokio::time::timeout(Duration::from_secs(10), run_gpg(&invocation))
            .await
            .expect("gpg run blocked on the passphrase pipe")
            .unwrap();

        assert!(output.success());
        let count: usize = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();
        assert_eq!(count, 256 * 1024 + 1);
    }

    #[tokio::test]
    async fn passphrase_ignored_by_gpg_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gpg = script(dir.path(), "gpg", "exit 0");

        let invocation = GpgInvocation::new(gpg, vec![], input(b""))
            .with_passphrase(SecretString::from("x".repeat(256 * 1024)));
        let output = run_gpg(&invocation).await.unwrap();
        assert!(output.success());
    }

    #[tokio::test]
    async fn signal_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let gpg = script(dir.path(), "gpg", "kill -9 $$");

        let output = run_gpg(&GpgInvocation::new(gpg, vec![], input(b""))).await.unwrap();
        assert_eq!(output.termination, Termination::Signaled(9));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_gpg(&GpgInvocation::new(dir.path().join("nope"), vec![], input(b""))).await;
        assert!(matches!(result, Err(GpgError::Spawn { .. })));
    }
}

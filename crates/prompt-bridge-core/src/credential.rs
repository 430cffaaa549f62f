//! git credential-helper protocol.
//!
//! git writes `key=value` lines terminated by a blank line and expects the
//! same format back. For `get`, the adapter first lets the system-level
//! helpers answer, then asks the host dialog, and if both fail it still
//! answers with an empty block so git never sees a malformed response.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Environment;
use crate::git::{restore_original_environment, strip_injected_config, GitConfigReader};
use crate::traits::{Dialog, DialogError};
use crate::types::{DialogReply, DialogRequest};

/// Response written when nothing could provide a credential.
pub const EMPTY_RESPONSE: &str = "quit=true\n\n";

/// Fields copied from the dialog reply into the response, in output order.
const REPLY_FIELDS: [&str; 4] = ["protocol", "host", "username", "password"];

/// Errors from the credential adapter.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// git sent a line that is not `key=value`.
    #[error("malformed credential line: {0:?}")]
    MalformedLine(String),

    /// Failed to read the query or talk to a child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No system-level credential helper is configured.
    #[error("no system credential helpers configured")]
    NoSystemHelpers,

    /// `git credential fill` failed or returned no password.
    #[error("git credential fill did not produce a password (exit status {0:?})")]
    NoPassword(Option<i32>),

    /// The dialog round trip failed.
    #[error(transparent)]
    Dialog(#[from] DialogError),
}

/// The action git asked the helper to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Get,
    /// `store`, `erase`, or anything newer; accepted and ignored.
    Other(String),
}

impl Action {
    pub fn parse(action: &str) -> Self {
        match action {
            "get" => Action::Get,
            other => Action::Other(other.to_string()),
        }
    }
}

/// The attributes git sent, in the order it sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialQuery {
    fields: Vec<(String, String)>,
}

impl CredentialQuery {
    /// Parse `key=value` lines up to the first blank line (or end of input).
    pub fn parse(input: &str) -> Result<Self, CredentialError> {
        let mut query = Self::default();
        for line in input.lines() {
            if !query.push_line(line)? {
                break;
            }
        }
        Ok(query)
    }

    /// Read a query from git's stdin.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CredentialError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut query = Self::default();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            if !query.push_line(&line)? {
                break;
            }
        }
        Ok(query)
    }

    /// Returns false at the terminating blank line.
    fn push_line(&mut self, line: &str) -> Result<bool, CredentialError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Ok(false);
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| CredentialError::MalformedLine(line.to_string()))?;
        self.set(key, value);
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the value of `key`, or append it if absent.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.fields.push((key.to_string(), value.to_string())),
        }
    }

    /// Copy `username` into `auth`, which is what the dialog pre-fills.
    pub fn promote_username(&mut self) {
        if let Some(username) = self.get("username").map(str::to_string) {
            self.set("auth", &username);
        }
    }

    /// `protocol://[username@]host`, used as the dialog prompt.
    pub fn url(&self) -> String {
        let mut url = String::new();
        if let Some(protocol) = self.get("protocol") {
            url.push_str(protocol);
            url.push_str("://");
        }
        if let Some(username) = self.get("username") {
            url.push_str(username);
            url.push('@');
        }
        if let Some(host) = self.get("host") {
            url.push_str(host);
        }
        url
    }

    /// Serialize as protocol lines followed by a blank line.
    pub fn to_protocol(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Credential sources that need no UI.
pub trait NativeCredentials: Send + Sync {
    /// Return the full `git credential fill` output on success.
    fn fill<'a>(
        &'a self,
        query: &'a CredentialQuery,
    ) -> Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send + 'a>>;
}

/// Runs `git credential fill` with only the system-level helpers.
#[derive(Debug, Clone)]
pub struct SystemCredentialHelpers {
    env: Environment,
    reader: GitConfigReader,
    enabled: bool,
}

impl SystemCredentialHelpers {
    pub fn new(env: &Environment, enabled: bool) -> Self {
        Self {
            env: env.clone(),
            reader: GitConfigReader::new(env),
            enabled,
        }
    }

    async fn run_fill(&self, query: &CredentialQuery) -> Result<String, CredentialError> {
        if !self.enabled {
            return Err(CredentialError::NoSystemHelpers);
        }
        let helpers = self.reader.get_all_system("credential.helper").await;
        if helpers.is_empty() {
            return Err(CredentialError::NoSystemHelpers);
        }
        debug!(helpers = ?helpers, "Trying system credential helpers");

        let mut command = Command::new("git");
        command.args(helper_args(&helpers));
        command.args(["credential", "fill"]);
        if let Some(workdir) = &self.env.workdir {
            command.current_dir(workdir);
        }
        strip_injected_config(&mut command);
        restore_original_environment(&mut command, &self.env);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(query.to_protocol().as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() && has_password(&stdout) {
            return Ok(stdout);
        }
        debug!(
            status = ?output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "System credential helpers did not answer"
        );
        Err(CredentialError::NoPassword(output.status.code()))
    }
}

impl NativeCredentials for SystemCredentialHelpers {
    fn fill<'a>(
        &'a self,
        query: &'a CredentialQuery,
    ) -> Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send + 'a>> {
        Box::pin(self.run_fill(query))
    }
}

/// `-c credential.helper=` resets the helper list, then each system helper
/// is registered again.
fn helper_args(helpers: &[String]) -> Vec<String> {
    let mut args = vec!["-c".to_string(), "credential.helper=".to_string()];
    for helper in helpers {
        args.push("-c".to_string());
        args.push(format!("credential.helper={}", helper));
    }
    args
}

fn has_password(stdout: &str) -> bool {
    stdout.lines().any(|line| line.starts_with("password="))
}

/// Answers `git credential get`.
pub struct GitCredentialAdapter<N, D> {
    native: N,
    dialog: D,
}

impl<N: NativeCredentials, D: Dialog> GitCredentialAdapter<N, D> {
    pub fn new(native: N, dialog: D) -> Self {
        Self { native, dialog }
    }

    /// Resolve a credential. Always returns a well-formed response.
    pub async fn get(&self, query: CredentialQuery) -> String {
        match self.native.fill(&query).await {
            Ok(stdout) => {
                info!("Credential provided by system helper");
                return stdout;
            }
            Err(e) => debug!(error = %e, "Native credential lookup failed"),
        }

        match self.ask_dialog(query).await {
            Ok(response) => {
                info!("Credential provided by dialog");
                response
            }
            Err(e) => {
                warn!(error = %e, "Dialog credential lookup failed");
                EMPTY_RESPONSE.to_string()
            }
        }
    }

    async fn ask_dialog(&self, mut query: CredentialQuery) -> Result<String, CredentialError> {
        let include_username = query.get("username").is_none();
        let prompt = query.url();
        query.promote_username();

        let request = DialogRequest::new(prompt)
            .with_username_field(include_username)
            .with_auth(query.get("auth").map(str::to_string));
        let reply = self.dialog.ask(request).await?;

        render_reply(&query, &reply)
    }
}

/// Merge the dialog reply over the query and format the response.
///
/// Fields missing from the reply keep the query's value; the result must
/// contain a password.
pub fn render_reply(query: &CredentialQuery, reply: &DialogReply) -> Result<String, CredentialError> {
    if reply.password.is_none() && query.get("password").is_none() {
        return Err(DialogError::MissingPassword.into());
    }

    let mut out = String::new();
    for field in REPLY_FIELDS {
        let from_reply = match field {
            "protocol" => reply.protocol.as_deref(),
            "host" => reply.host.as_deref(),
            "username" => reply.username.as_deref(),
            _ => reply.password.as_ref().map(|p| p.expose_secret()),
        };
        if let Some(value) = from_reply.or_else(|| query.get(field)) {
            out.push_str(field);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
    }
    out.push_str("quit=true\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FailingNative;

    impl NativeCredentials for FailingNative {
        fn fill<'a>(
            &'a self,
            _query: &'a CredentialQuery,
        ) -> Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send + 'a>> {
            Box::pin(async { Err(CredentialError::NoSystemHelpers) })
        }
    }

    struct FixedNative(&'static str);

    impl NativeCredentials for FixedNative {
        fn fill<'a>(
            &'a self,
            _query: &'a CredentialQuery,
        ) -> Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send + 'a>> {
            let stdout = self.0.to_string();
            Box::pin(async move { Ok(stdout) })
        }
    }

    /// Dialog mock that records requests and replays a JSON reply.
    struct MockDialog {
        reply: Option<&'static str>,
        calls: AtomicUsize,
        last_request: Mutex<Option<DialogRequest>>,
    }

    impl MockDialog {
        fn replying(json: &'static str) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(json),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }
    }

    impl Dialog for Arc<MockDialog> {
        fn ask(
            &self,
            request: DialogRequest,
        ) -> Pin<Box<dyn Future<Output = Result<DialogReply, DialogError>> + Send + '_>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request);
            let reply = self.reply;
            Box::pin(async move {
                match reply {
                    Some(json) => Ok(crate::protocol::decode_reply(json.as_bytes())?),
                    None => Err(DialogError::Connection {
                        path: "/nonexistent".into(),
                        source: std::io::Error::from(std::io::ErrorKind::NotFound),
                    }),
                }
            })
        }
    }

    #[test]
    fn parse_stops_at_blank_line() {
        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n\nignored=1\n").unwrap();
        assert_eq!(query.get("protocol"), Some("https"));
        assert_eq!(query.get("host"), Some("example.com"));
        assert_eq!(query.get("ignored"), None);
    }

    #[test]
    fn parse_keeps_equals_in_values() {
        let query = CredentialQuery::parse("password=a=b=c\n\n").unwrap();
        assert_eq!(query.get("password"), Some("a=b=c"));
    }

    #[test]
    fn parse_rejects_line_without_equals() {
        let err = CredentialQuery::parse("protocol=https\ngarbage\n\n").unwrap_err();
        assert!(matches!(err, CredentialError::MalformedLine(line) if line == "garbage"));
    }

    #[tokio::test]
    async fn read_from_handles_crlf_and_eof() {
        let mut input: &[u8] = b"protocol=https\r\nhost=example.com";
        let query = CredentialQuery::read_from(&mut input).await.unwrap();
        assert_eq!(query.get("protocol"), Some("https"));
        assert_eq!(query.get("host"), Some("example.com"));
    }

    #[test]
    fn url_includes_username_when_known() {
        let query = CredentialQuery::parse("protocol=https\nhost=example.com\nusername=u\n").unwrap();
        assert_eq!(query.url(), "https://u@example.com");

        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n").unwrap();
        assert_eq!(query.url(), "https://example.com");
    }

    #[test]
    fn promote_username_sets_auth() {
        let mut query = CredentialQuery::parse("username=u\n").unwrap();
        query.promote_username();
        assert_eq!(query.get("auth"), Some("u"));
        assert_eq!(query.get("username"), Some("u"));
    }

    #[test]
    fn to_protocol_preserves_order() {
        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n").unwrap();
        assert_eq!(query.to_protocol(), "protocol=https\nhost=example.com\n\n");
    }

    #[test]
    fn helper_args_reset_then_register() {
        let args = helper_args(&["cache --timeout=60".to_string(), "store".to_string()]);
        assert_eq!(
            args,
            vec![
                "-c",
                "credential.helper=",
                "-c",
                "credential.helper=cache --timeout=60",
                "-c",
                "credential.helper=store",
            ]
        );
    }

    #[test]
    fn action_parse() {
        assert_eq!(Action::parse("get"), Action::Get);
        assert_eq!(Action::parse("store"), Action::Other("store".to_string()));
    }

    #[tokio::test]
    async fn native_success_is_returned_verbatim() {
        let native_out = "protocol=https\nhost=example.com\nusername=n\npassword=native\n";
        let dialog = MockDialog::replying(r#"{"password":"unused"}"#);
        let adapter = GitCredentialAdapter::new(FixedNative(native_out), Arc::clone(&dialog));

        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n").unwrap();
        assert_eq!(adapter.get(query).await, native_out);
        assert_eq!(dialog.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dialog_reply_is_merged_and_terminated() {
        let dialog = MockDialog::replying(
            r#"{"protocol":"https","host":"example.com","username":"u","password":"p"}"#,
        );
        let adapter = GitCredentialAdapter::new(FailingNative, Arc::clone(&dialog));

        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n\n").unwrap();
        assert_eq!(
            adapter.get(query).await,
            "protocol=https\nhost=example.com\nusername=u\npassword=p\nquit=true\n"
        );

        let request = dialog.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.prompt, "https://example.com");
        assert!(request.include_username);
        assert!(request.auth.is_none());
    }

    #[tokio::test]
    async fn missing_reply_fields_fall_back_to_query() {
        let dialog = MockDialog::replying(r#"{"password":"p"}"#);
        let adapter = GitCredentialAdapter::new(FailingNative, Arc::clone(&dialog));

        let query =
            CredentialQuery::parse("protocol=https\nhost=example.com\nusername=alice\n\n").unwrap();
        assert_eq!(
            adapter.get(query).await,
            "protocol=https\nhost=example.com\nusername=alice\npassword=p\nquit=true\n"
        );

        let request = dialog.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.prompt, "https://alice@example.com");
        assert!(!request.include_username);
        assert_eq!(request.auth.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn all_sources_failing_yields_empty_response() {
        let dialog = MockDialog::unreachable();
        let adapter = GitCredentialAdapter::new(FailingNative, Arc::clone(&dialog));

        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n\n").unwrap();
        assert_eq!(adapter.get(query).await, "quit=true\n\n");
        assert_eq!(dialog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reply_without_password_yields_empty_response() {
        let dialog = MockDialog::replying(r#"{"username":"u"}"#);
        let adapter = GitCredentialAdapter::new(FailingNative, Arc::clone(&dialog));

        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n\n").unwrap();
        assert_eq!(adapter.get(query).await, EMPTY_RESPONSE);
    }

    #[tokio::test]
    async fn malformed_reply_yields_empty_response() {
        let dialog = MockDialog::replying("[1, 2, 3]");
        let adapter = GitCredentialAdapter::new(FailingNative, Arc::clone(&dialog));

        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n\n").unwrap();
        assert_eq!(adapter.get(query).await, EMPTY_RESPONSE);
    }

    #[tokio::test]
    async fn system_helpers_run_with_clean_git_environment() {
        use std::ffi::OsString;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");
        std::fs::create_dir(&record).unwrap();
        let git = dir.path().join("git");
        std::fs::write(
            &git,
            format!(
                "#!/bin/sh\n\
                 if [ \"$1\" = config ]; then printf 'store --file=/creds\\ncache\\n'; exit 0; fi\n\
                 printf '%s\\n' \"$@\" > {0}/argv\n\
                 env > {0}/env\n\
                 cat > {0}/stdin\n\
                 printf 'protocol=https\\nhost=example.com\\nusername=n\\npassword=x\\n'\n",
                record.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&git, std::fs::Permissions::from_mode(0o755)).unwrap();

        // What git exports to a helper it was told about with `-c`.
        std::env::set_var("GIT_CONFIG_PARAMETERS", "'credential.helper'='/opt/bridge/git-credential-bridge'");
        std::env::set_var("GIT_CONFIG_COUNT", "1");
        std::env::set_var("GIT_CONFIG_KEY_0", "credential.helper");
        std::env::set_var("GIT_CONFIG_VALUE_0", "/opt/bridge/git-credential-bridge");
        std::env::set_var("SSH_ASKPASS", "/opt/bridge/askpass");

        let original_path = format!("{}:/usr/bin:/bin", dir.path().display());
        let env = Environment {
            original_path: Some(OsString::from(&original_path)),
            original_git_askpass: Some(OsString::from("/usr/lib/git-core/askpass")),
            ..Environment::default()
        };
        let dialog = MockDialog::unreachable();
        let adapter = GitCredentialAdapter::new(SystemCredentialHelpers::new(&env, true), Arc::clone(&dialog));

        let query = CredentialQuery::parse("protocol=https\nhost=example.com\n\n").unwrap();
        assert_eq!(
            adapter.get(query).await,
            "protocol=https\nhost=example.com\nusername=n\npassword=x\n"
        );
        assert_eq!(dialog.calls.load(Ordering::SeqCst), 0);

        let argv = std::fs::read_to_string(record.join("argv")).unwrap();
        assert_eq!(
            argv.lines().collect::<Vec<_>>(),
            vec![
                "-c",
                "credential.helper=",
                "-c",
                "credential.helper=store --file=/creds",
                "-c",
                "credential.helper=cache",
                "credential",
                "fill",
            ]
        );
        assert_eq!(
            std::fs::read_to_string(record.join("stdin")).unwrap(),
            "protocol=https\nhost=example.com\n\n"
        );

        let child_env = std::fs::read_to_string(record.join("env")).unwrap();
        let vars: Vec<&str> = child_env.lines().collect();
        assert!(vars.contains(&format!("PATH={}", original_path).as_str()));
        assert!(vars.contains(&"GIT_ASKPASS=/usr/lib/git-core/askpass"));
        for key in [
            "GIT_CONFIG_PARAMETERS=",
            "GIT_CONFIG_COUNT=",
            "GIT_CONFIG_KEY_0=",
            "GIT_CONFIG_VALUE_0=",
            "SSH_ASKPASS=",
        ] {
            assert!(
                !vars.iter().any(|line| line.starts_with(key)),
                "{} leaked into git credential fill",
                key
            );
        }
    }

    #[tokio::test]
    async fn disabled_system_helpers_fail_without_running_git() {
        let helpers = SystemCredentialHelpers::new(&Environment::default(), false);
        let query = CredentialQuery::parse("protocol=https\n").unwrap();
        assert!(matches!(
            helpers.fill(&query).await,
            Err(CredentialError::NoSystemHelpers)
        ));
    }
}

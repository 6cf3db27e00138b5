//! A single SSH connection with working-directory tracking.
//!
//! Each [`Connection`] owns one russh transport plus the state that makes a
//! sequence of independent exec requests feel like one shell:
//!
//! - **CWD tracking**: every command runs in a fresh exec channel, so `cd`
//!   would otherwise be lost. Commands are wrapped so the shell reports its
//!   final working directory after the user command, separated by a
//!   per-call nonce the user command cannot guess; the post-nonce `pwd`
//!   line becomes the working directory for the next call.
//! - **SFTP**: an SFTP session is opened lazily on first use and memoized;
//!   it is discarded on reconnect and close.
//! - **Jump hosts**: a connection with a `via` dials through the jump's
//!   transport using a `direct-tcpip` channel and runs the SSH handshake
//!   over that stream.
//!
//! Callers never use a `Connection` directly; the manager serializes access
//! through its per-alias locks.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use rand::distributions::Alphanumeric;
use rand::Rng;
use russh::{ChannelMsg, Disconnect, Sig, client, keys};
use russh_sftp::client::SftpSession;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::auth::select_strategy;
use super::config::MAX_DIAL_RETRY_DELAY;
use super::error::GatewayError;
use super::keys::KeyStore;
use super::quote::sh_quote;

/// russh client handler that accepts every host key, the moral equivalent of
/// `StrictHostKeyChecking=no`. The deployment assumption is a trusted
/// network perimeter; see the operator documentation.
pub struct AcceptAllHosts;

impl client::Handler for AcceptAllHosts {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connection parameters, kept for reconnection.
#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    /// Alias of the jump host this connection tunnels through, if any.
    pub via: Option<String>,
}

/// Result of one remote command execution.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Working directory after the command ran.
    pub cwd: String,
}

struct ConnState {
    handle: client::Handle<AcceptAllHosts>,
    sftp: Option<Arc<SftpSession>>,
    cwd: String,
}

/// One live SSH connection.
pub(crate) struct Connection {
    alias: String,
    creds: Credentials,
    key_store: Arc<KeyStore>,
    connect_timeout: Duration,
    dial_retries: u32,
    connected_at: String,
    state: Mutex<ConnState>,
}

impl Connection {
    /// Dial, authenticate and capture the initial working directory.
    pub(crate) async fn open(
        alias: String,
        creds: Credentials,
        key_store: Arc<KeyStore>,
        jump: Option<Arc<Connection>>,
        connect_timeout: Duration,
        dial_retries: u32,
    ) -> Result<Self, GatewayError> {
        let handle = dial_with_retry(
            &creds,
            &key_store,
            jump.as_ref(),
            connect_timeout,
            dial_retries,
        )
        .await?;

        let cwd = match initial_cwd(&handle).await {
            Ok(cwd) => cwd,
            Err(err) => {
                warn!(alias = %alias, error = %err, "failed to read initial working directory");
                "~".to_string()
            }
        };

        info!(alias = %alias, user = %creds.username, host = %creds.host, %cwd, "connected");

        Ok(Self {
            alias,
            creds,
            key_store,
            connect_timeout,
            dial_retries,
            connected_at: chrono::Utc::now().to_rfc3339(),
            state: Mutex::new(ConnState {
                handle,
                sftp: None,
                cwd,
            }),
        })
    }

    /// RFC3339 timestamp of the initial connect (reconnects keep it).
    pub(crate) fn connected_at(&self) -> &str {
        &self.connected_at
    }

    pub(crate) fn alias(&self) -> &str {
        &self.alias
    }

    pub(crate) fn username(&self) -> &str {
        &self.creds.username
    }

    pub(crate) fn host(&self) -> &str {
        &self.creds.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.creds.port
    }

    pub(crate) fn via(&self) -> Option<&str> {
        self.creds.via.as_deref()
    }

    /// Current working directory, as of the last completed command.
    pub(crate) async fn cwd(&self) -> String {
        self.state.lock().await.cwd.clone()
    }

    /// Execute `cmd` in a fresh exec channel with the tracked CWD preset.
    ///
    /// Stdout and stderr are captured separately. On deadline expiry the
    /// remote process is sent SIGKILL and a cancellation error is returned;
    /// partial output is discarded so a timed-out long command is never
    /// mistaken for a successful short one.
    pub(crate) async fn run(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<RunOutput, GatewayError> {
        let mut state = self.state.lock().await;

        let nonce = fresh_nonce();
        let wrapped = wrap_command(&state.cwd, cmd, &nonce);
        debug!(alias = %self.alias, %cmd, "executing");

        let mut channel = state
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to open channel: {}", e)))?;
        channel
            .exec(true, wrapped.as_str())
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to start command: {}", e)))?;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        let collected = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in the SSH protocol
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        if collected.is_err() {
            let _ = channel.signal(Sig::KILL).await;
            let _ = channel.close().await;
            warn!(alias = %self.alias, timeout_secs = timeout.as_secs(), "command timed out");
            return Err(GatewayError::Cancelled(timeout.as_secs()));
        }

        let _ = channel.close().await;

        let stdout_str = String::from_utf8_lossy(&stdout).into_owned();
        let stderr_str = String::from_utf8_lossy(&stderr).into_owned();

        let (clean, new_cwd) = split_on_nonce(&stdout_str, &nonce);
        if let Some(cwd) = new_cwd {
            state.cwd = cwd;
        }

        Ok(RunOutput {
            stdout: clean.trim().to_string(),
            stderr: stderr_str.trim().to_string(),
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
            cwd: state.cwd.clone(),
        })
    }

    /// The memoized SFTP session, opened on first use.
    pub(crate) async fn sftp(&self) -> Result<Arc<SftpSession>, GatewayError> {
        let mut state = self.state.lock().await;

        if let Some(sftp) = &state.sftp {
            return Ok(sftp.clone());
        }

        let channel = state
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to open channel: {}", e)))?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            GatewayError::Sftp(format!("failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| GatewayError::Sftp(e.to_string()))?;

        debug!(alias = %self.alias, "SFTP subsystem opened");
        let sftp = Arc::new(sftp);
        state.sftp = Some(sftp.clone());
        Ok(sftp)
    }

    /// Replace the transport, preserving alias, credentials and CWD.
    ///
    /// The caller must hold this alias's manager lock. The memoized SFTP
    /// session belongs to the old transport and is discarded.
    pub(crate) async fn reconnect(
        &self,
        jump: Option<Arc<Connection>>,
    ) -> Result<(), GatewayError> {
        info!(alias = %self.alias, "reconnecting");
        let handle = dial_with_retry(
            &self.creds,
            &self.key_store,
            jump.as_ref(),
            self.connect_timeout,
            self.dial_retries,
        )
        .await?;

        let mut state = self.state.lock().await;
        state.sftp = None;
        state.handle = handle;
        Ok(())
    }

    /// Tear down SFTP, then the transport.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        state.sftp = None;
        if let Err(err) = state
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!(alias = %self.alias, error = %err, "disconnect");
        }
    }

    /// Open a `direct-tcpip` channel through this connection, for use as a
    /// jump host.
    async fn open_tunnel(
        &self,
        target_host: &str,
        target_port: u16,
    ) -> Result<russh::Channel<client::Msg>, GatewayError> {
        let state = self.state.lock().await;
        state
            .handle
            .channel_open_direct_tcpip(target_host, target_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                GatewayError::Transport(format!(
                    "failed to tunnel through '{}': {}",
                    self.alias, e
                ))
            })
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        // Connections are long-lived and reaped by the pool, so no
        // inactivity timeout; keepalives detect dead peers instead.
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Dial and authenticate, retrying transient failures with exponential
/// backoff and jitter. Authentication failures are never retried.
async fn dial_with_retry(
    creds: &Credentials,
    key_store: &Arc<KeyStore>,
    jump: Option<&Arc<Connection>>,
    connect_timeout: Duration,
    dial_retries: u32,
) -> Result<client::Handle<AcceptAllHosts>, GatewayError> {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(MAX_DIAL_RETRY_DELAY)
        .with_max_times(dial_retries as usize)
        .with_jitter();

    (|| async { dial_and_auth(creds, key_store, jump, connect_timeout).await })
        .retry(backoff)
        .when(|err: &GatewayError| !matches!(err, GatewayError::Auth(_) | GatewayError::Key(_)))
        .notify(|err, dur| {
            warn!(error = %err, retry_in = ?dur, "dial failed, retrying");
        })
        .await
}

async fn dial_and_auth(
    creds: &Credentials,
    key_store: &Arc<KeyStore>,
    jump: Option<&Arc<Connection>>,
    connect_timeout: Duration,
) -> Result<client::Handle<AcceptAllHosts>, GatewayError> {
    let config = client_config();

    let mut handle = match jump {
        Some(jump_conn) => {
            let channel = jump_conn.open_tunnel(&creds.host, creds.port).await?;
            tokio::time::timeout(
                connect_timeout,
                client::connect_stream(config, channel.into_stream(), AcceptAllHosts),
            )
            .await
            .map_err(|_| {
                GatewayError::Transport(format!(
                    "connection to {}:{} via jump timed out after {:?}",
                    creds.host, creds.port, connect_timeout
                ))
            })?
            .map_err(|e| GatewayError::Transport(format!("failed to connect: {}", e)))?
        }
        None => tokio::time::timeout(
            connect_timeout,
            client::connect(
                config,
                (creds.host.as_str(), creds.port),
                AcceptAllHosts,
            ),
        )
        .await
        .map_err(|_| {
            GatewayError::Transport(format!(
                "connection to {}:{} timed out after {:?}",
                creds.host, creds.port, connect_timeout
            ))
        })?
        .map_err(|e| GatewayError::Transport(format!("failed to connect: {}", e)))?,
    };

    let strategy = select_strategy(
        creds.password.as_deref(),
        creds.key_path.as_deref(),
        key_store,
    );
    debug!(method = strategy.name(), user = %creds.username, host = %creds.host, "authenticating");

    let authenticated = strategy.authenticate(&mut handle, &creds.username).await?;
    if !authenticated {
        return Err(GatewayError::Auth(format!(
            "{} authentication rejected for {}@{}",
            strategy.name(),
            creds.username,
            creds.host
        )));
    }

    Ok(handle)
}

/// Read the login shell's working directory right after connecting.
async fn initial_cwd(
    handle: &client::Handle<AcceptAllHosts>,
) -> Result<String, GatewayError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| GatewayError::Transport(format!("failed to open channel: {}", e)))?;
    channel
        .exec(true, "pwd")
        .await
        .map_err(|e| GatewayError::Transport(format!("failed to run pwd: {}", e)))?;

    let mut out = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => out.extend_from_slice(&data),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    let _ = channel.close().await;

    let cwd = String::from_utf8_lossy(&out).trim().to_string();
    if cwd.is_empty() {
        return Err(GatewayError::Transport("pwd produced no output".into()));
    }
    Ok(cwd)
}

/// Wrap a user command so the shell reports its final working directory.
///
/// The exit status is carried by the shell's own `exit`, so the wrapping
/// never masks the user command's status. A CWD of the literal `~` is left
/// unquoted for the shell to expand.
fn wrap_command(cwd: &str, cmd: &str, nonce: &str) -> String {
    let cd = if cwd == "~" {
        "cd ~".to_string()
    } else {
        format!("cd {}", sh_quote(cwd))
    };
    format!(
        "{} && {}; __rc=$?; printf '\\n'; printf '%s\\n' {}; pwd; exit $__rc",
        cd,
        cmd,
        sh_quote(nonce)
    )
}

/// Split captured stdout at the nonce: the part before it belongs to the
/// user command, the trimmed remainder is the shell's final `pwd`.
fn split_on_nonce(stdout: &str, nonce: &str) -> (String, Option<String>) {
    match stdout.find(nonce) {
        Some(idx) => {
            let clean = stdout[..idx].to_string();
            let rest = stdout[idx + nonce.len()..].trim();
            let cwd = (!rest.is_empty()).then(|| rest.to_string());
            (clean, cwd)
        }
        None => (stdout.to_string(), None),
    }
}

/// A per-call token the user command cannot predict.
fn fresh_nonce() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("__CWD_{}__", token)
}

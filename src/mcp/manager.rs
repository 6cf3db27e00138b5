//! Per-tenant connection manager.
//!
//! A [`Manager`] owns one tenant's keyed set of SSH connections. It is the
//! unit of isolation: aliases are unique within a manager and never shared
//! across managers.
//!
//! Concurrency model:
//!
//! - the alias registry is guarded by a `parking_lot::RwLock`, held only for
//!   map access, never across await points;
//! - every alias has its own async mutex in a `DashMap` lock table; all
//!   run/SFTP/reconnect operations against an alias hold that mutex, so
//!   operations on one alias are serialized while different aliases proceed
//!   in parallel;
//! - `sync_file` is the only operation holding two alias locks, and it
//!   acquires them in lexicographic order to stay deadlock-free.
//!
//! Alias allocation inserts a reservation placeholder into the registry
//! before the network handshake so two concurrent auto-alias requests for
//! the same `user@host` cannot both claim the base name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::config::{resolve_connect_timeout, resolve_dial_retries, resolve_max_output};
use super::connection::{Connection, Credentials, RunOutput};
use super::error::GatewayError;
use super::keys::KeyStore;
use super::quote::{format_permissions, resolve_remote_path};
use super::types::{ConnectionInfo, FileEntry};

/// Highest numeric suffix tried when auto-generating an alias.
const MAX_ALIAS_SUFFIX: u32 = 100;

/// Parameters for [`Manager::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub alias: Option<String>,
    pub via: Option<String>,
}

/// One file-editing operation for [`Manager::edit_file`].
#[derive(Debug, Clone)]
pub enum EditOp {
    /// Literal find-and-replace.
    Replace {
        old: String,
        new: String,
        all: bool,
    },
    /// Regular-expression replace; `$1`, `$2` refer to capture groups.
    Pattern {
        pattern: String,
        replacement: String,
        all: bool,
    },
}

/// A registry slot: either a live connection or a name reserved while its
/// handshake is still in flight.
enum Slot {
    Reserved,
    Live(Arc<Connection>),
}

struct Registry {
    connections: HashMap<String, Slot>,
    primary: String,
}

/// One tenant's connection set.
pub struct Manager {
    key_store: Arc<KeyStore>,
    state: RwLock<Registry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_output: usize,
    connect_timeout: Duration,
    dial_retries: u32,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

/// Removes an alias reservation when a connect attempt unwinds early.
struct ReservationGuard<'a> {
    manager: &'a Manager,
    alias: String,
    armed: bool,
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut registry = self.manager.state.write();
            if matches!(registry.connections.get(&self.alias), Some(Slot::Reserved)) {
                registry.connections.remove(&self.alias);
            }
        }
    }
}

impl Manager {
    /// Create an empty manager. Construction does no network I/O.
    pub fn new(key_store: Arc<KeyStore>) -> Self {
        Self {
            key_store,
            state: RwLock::new(Registry {
                connections: HashMap::new(),
                primary: String::new(),
            }),
            locks: DashMap::new(),
            max_output: resolve_max_output(),
            connect_timeout: resolve_connect_timeout(),
            dial_retries: resolve_dial_retries(),
        }
    }

    /// Establish a connection and return its alias.
    ///
    /// Re-connecting the same `user@host` under an existing live alias is
    /// benign and returns that alias; any other collision fails without
    /// mutating state.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<String, GatewayError> {
        let port = opts.port.unwrap_or(22);
        let explicit = opts.alias.as_deref().filter(|a| !a.is_empty());
        let via = opts.via.as_deref().filter(|v| !v.is_empty());

        let alias = match explicit {
            None => self.reserve_generated(&opts.username, &opts.host)?,
            Some(name) => {
                let mut registry = self.state.write();
                match registry.connections.get(name) {
                    Some(Slot::Live(existing)) => {
                        if existing.host() == opts.host && existing.username() == opts.username {
                            return Ok(name.to_string());
                        }
                        return Err(GatewayError::AliasInUse(name.to_string()));
                    }
                    Some(Slot::Reserved) => {
                        return Err(GatewayError::Validation(format!(
                            "alias '{}' is currently connecting",
                            name
                        )));
                    }
                    None => {
                        registry
                            .connections
                            .insert(name.to_string(), Slot::Reserved);
                        name.to_string()
                    }
                }
            }
        };

        let mut reservation = ReservationGuard {
            manager: self,
            alias: alias.clone(),
            armed: true,
        };

        if via == Some(alias.as_str()) {
            return Err(GatewayError::Validation(
                "'via' cannot be the same as 'alias'".into(),
            ));
        }

        let jump = match via {
            Some(jump_alias) => Some(self.live(jump_alias).map_err(|_| {
                GatewayError::Transport(format!("jump host '{}' not connected", jump_alias))
            })?),
            None => None,
        };

        let creds = Credentials {
            host: opts.host.clone(),
            port,
            username: opts.username.clone(),
            password: opts.password.clone(),
            key_path: opts.key_path.clone(),
            via: via.map(str::to_string),
        };

        let connection = Connection::open(
            alias.clone(),
            creds,
            self.key_store.clone(),
            jump,
            self.connect_timeout,
            self.dial_retries,
        )
        .await?;

        {
            let mut registry = self.state.write();
            registry
                .connections
                .insert(alias.clone(), Slot::Live(Arc::new(connection)));
            if registry.primary.is_empty() {
                registry.primary = alias.clone();
            }
        }
        reservation.armed = false;

        Ok(alias)
    }

    /// Close one connection, or all of them when `alias` is empty.
    pub async fn disconnect(&self, alias: Option<&str>) -> Result<String, GatewayError> {
        let alias = alias.unwrap_or("").trim();

        if alias.is_empty() {
            let doomed: Vec<Arc<Connection>> = {
                let mut registry = self.state.write();
                let doomed = registry
                    .connections
                    .drain()
                    .filter_map(|(_, slot)| match slot {
                        Slot::Live(conn) => Some(conn),
                        Slot::Reserved => None,
                    })
                    .collect();
                registry.primary.clear();
                doomed
            };
            let count = doomed.len();
            for conn in doomed {
                conn.close().await;
            }
            return Ok(format!("Disconnected all ({}) connections", count));
        }

        let removed = {
            let mut registry = self.state.write();
            let removed = registry
                .connections
                .remove(alias)
                .ok_or_else(|| GatewayError::NoSuchAlias(alias.to_string()))?;
            if registry.primary == alias {
                let next = registry
                    .connections
                    .iter()
                    .find_map(|(name, slot)| {
                        matches!(slot, Slot::Live(_)).then(|| name.clone())
                    })
                    .unwrap_or_default();
                registry.primary = next;
            }
            removed
        };

        if let Slot::Live(conn) = removed {
            conn.close().await;
        }

        Ok(format!("Disconnected '{}'", alias))
    }

    /// Execute a command, transparently reconnecting once on transport loss.
    pub async fn run(
        &self,
        cmd: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<RunOutput, GatewayError> {
        let alias = self.resolve_target(target)?;
        let lock = self.alias_lock(&alias);
        let _guard = lock.lock().await;

        let conn = self.live(&alias)?;

        match conn.run(cmd, timeout).await {
            Err(err) if err.is_transport_loss() => {
                warn!(alias = %alias, error = %err, "transport lost, reconnecting");
                let jump = self.jump_for(&conn)?;
                conn.reconnect(jump)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("reconnect failed: {}", e)))?;
                conn.run(cmd, timeout).await
            }
            other => other,
        }
    }

    /// Execute a command and shape the output for a model-facing reply.
    pub async fn execute(
        &self,
        cmd: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let output = self.run(cmd, target, timeout).await?;
        Ok(shape_output(&output, self.max_output))
    }

    /// Read a remote file via SFTP.
    pub async fn read_file(&self, path: &str, target: &str) -> Result<String, GatewayError> {
        let alias = self.resolve_target(target)?;
        let lock = self.alias_lock(&alias);
        let _guard = lock.lock().await;

        let conn = self.live(&alias)?;
        let resolved = resolve_remote_path(path, &conn.cwd().await);
        let sftp = conn.sftp().await?;

        let mut file = sftp
            .open(&resolved)
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to open {}: {}", resolved, e)))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to read {}: {}", resolved, e)))?;

        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Write (create or truncate) a remote file via SFTP.
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        target: &str,
    ) -> Result<String, GatewayError> {
        let alias = self.resolve_target(target)?;
        let lock = self.alias_lock(&alias);
        let _guard = lock.lock().await;

        let conn = self.live(&alias)?;
        let resolved = resolve_remote_path(path, &conn.cwd().await);
        let sftp = conn.sftp().await?;

        let mut file = sftp
            .create(&resolved)
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to create {}: {}", resolved, e)))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to write {}: {}", resolved, e)))?;
        file.shutdown()
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to flush {}: {}", resolved, e)))?;

        Ok(resolved)
    }

    /// Apply an in-memory edit to a remote file (read, modify, write back).
    ///
    /// Not atomic against concurrent external writers; the last write wins.
    /// Returns the resolved path and the number of replacements.
    pub async fn edit_file(
        &self,
        path: &str,
        op: &EditOp,
        target: &str,
    ) -> Result<(String, usize), GatewayError> {
        let alias = self.resolve_target(target)?;
        let lock = self.alias_lock(&alias);
        let _guard = lock.lock().await;

        let conn = self.live(&alias)?;
        let resolved = resolve_remote_path(path, &conn.cwd().await);
        let sftp = conn.sftp().await?;

        let mut file = sftp
            .open(&resolved)
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to open {}: {}", resolved, e)))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to read {}: {}", resolved, e)))?;
        drop(file);

        let text = String::from_utf8_lossy(&content).into_owned();
        let (edited, count) = apply_edit(&text, op)?;

        let mut file = sftp
            .create(&resolved)
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to create {}: {}", resolved, e)))?;
        file.write_all(edited.as_bytes())
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to write {}: {}", resolved, e)))?;
        file.shutdown()
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to flush {}: {}", resolved, e)))?;

        Ok((resolved, count))
    }

    /// List a remote directory via SFTP.
    pub async fn list_dir(&self, path: &str, target: &str) -> Result<Vec<FileEntry>, GatewayError> {
        let alias = self.resolve_target(target)?;
        let lock = self.alias_lock(&alias);
        let _guard = lock.lock().await;

        let conn = self.live(&alias)?;
        let resolved = resolve_remote_path(path, &conn.cwd().await);
        let sftp = conn.sftp().await?;

        let read_dir = sftp
            .read_dir(&resolved)
            .await
            .map_err(|e| GatewayError::Sftp(format!("failed to list {}: {}", resolved, e)))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            let is_dir = metadata.is_dir();
            let is_symlink = metadata.is_symlink();
            entries.push(FileEntry {
                name,
                file_type: if is_dir { "dir" } else { "file" }.to_string(),
                size: metadata.size.unwrap_or(0),
                permissions: format_permissions(
                    metadata.permissions.unwrap_or(0) & 0o7777,
                    is_dir,
                    is_symlink,
                ),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(entries)
    }

    /// Stream a file from one alias to another through their SFTP sessions.
    ///
    /// The two alias locks are taken in lexicographic order regardless of
    /// transfer direction, so crossed concurrent syncs cannot deadlock.
    /// Returns the number of bytes copied.
    pub async fn sync_file(
        &self,
        source: &str,
        source_path: &str,
        dest: &str,
        dest_path: &str,
    ) -> Result<u64, GatewayError> {
        let src_alias = self.resolve_target(source)?;
        let dst_alias = self.resolve_target(dest)?;

        let (first, second) = if src_alias <= dst_alias {
            (src_alias.clone(), dst_alias.clone())
        } else {
            (dst_alias.clone(), src_alias.clone())
        };

        let _first_guard = self.alias_lock(&first).lock_owned().await;
        let _second_guard = if second != first {
            Some(self.alias_lock(&second).lock_owned().await)
        } else {
            None
        };

        let src_conn = self.live(&src_alias)?;
        let dst_conn = self.live(&dst_alias)?;

        let src_resolved = resolve_remote_path(source_path, &src_conn.cwd().await);
        let dst_resolved = resolve_remote_path(dest_path, &dst_conn.cwd().await);

        let src_sftp = src_conn.sftp().await?;
        let dst_sftp = dst_conn.sftp().await?;

        let mut src_file = src_sftp.open(&src_resolved).await.map_err(|e| {
            GatewayError::Sftp(format!("failed to open source {}: {}", src_resolved, e))
        })?;
        let mut dst_file = dst_sftp.create(&dst_resolved).await.map_err(|e| {
            GatewayError::Sftp(format!(
                "failed to create destination {}: {}",
                dst_resolved, e
            ))
        })?;

        let bytes = tokio::io::copy(&mut src_file, &mut dst_file)
            .await
            .map_err(|e| {
                GatewayError::Sftp(format!(
                    "failed to stream {} -> {}: {}",
                    src_resolved, dst_resolved, e
                ))
            })?;
        dst_file.shutdown().await.map_err(|e| {
            GatewayError::Sftp(format!("failed to flush {}: {}", dst_resolved, e))
        })?;

        Ok(bytes)
    }

    /// `"sudo "` unless the target connection is logged in as root.
    ///
    /// Advisory only; it does not validate the remote sudoers configuration.
    pub fn sudo_prefix(&self, target: &str) -> String {
        let username = self
            .resolve_target(target)
            .ok()
            .and_then(|alias| self.live(&alias).ok())
            .map(|conn| conn.username().to_string());
        match username.as_deref() {
            Some(name) => sudo_prefix_for(name).to_string(),
            None => sudo_prefix_for("").to_string(),
        }
    }

    /// Details of every live connection.
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let (connections, primary) = {
            let registry = self.state.read();
            let conns: Vec<Arc<Connection>> = registry
                .connections
                .values()
                .filter_map(|slot| match slot {
                    Slot::Live(conn) => Some(conn.clone()),
                    Slot::Reserved => None,
                })
                .collect();
            (conns, registry.primary.clone())
        };

        let mut details = Vec::with_capacity(connections.len());
        for conn in connections {
            details.push(ConnectionInfo {
                alias: conn.alias().to_string(),
                username: conn.username().to_string(),
                host: conn.host().to_string(),
                port: conn.port(),
                via: conn.via().map(str::to_string),
                cwd: conn.cwd().await,
                primary: conn.alias() == primary,
                connected_at: conn.connected_at().to_string(),
            });
        }
        details.sort_by(|a, b| a.alias.cmp(&b.alias));
        details
    }

    /// The gateway's public key in `authorized_keys` format.
    pub fn public_key(&self) -> Result<String, GatewayError> {
        self.key_store.public_key()
    }

    /// Close every connection. The manager remains usable afterwards.
    pub async fn close(&self) {
        let doomed: Vec<Arc<Connection>> = {
            let mut registry = self.state.write();
            let doomed = registry
                .connections
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(conn) => Some(conn),
                    Slot::Reserved => None,
                })
                .collect();
            registry.primary.clear();
            doomed
        };
        if !doomed.is_empty() {
            info!(count = doomed.len(), "closing connections");
        }
        for conn in doomed {
            conn.close().await;
        }
    }

    /// Resolve a `target` argument to a concrete alias.
    ///
    /// Blank or `"primary"` selects the current primary; anything else must
    /// name an existing entry.
    fn resolve_target(&self, target: &str) -> Result<String, GatewayError> {
        let registry = self.state.read();

        if !target.is_empty() && target != "primary" {
            if registry.connections.contains_key(target) {
                return Ok(target.to_string());
            }
            return Err(GatewayError::NoSuchAlias(target.to_string()));
        }

        if registry.primary.is_empty() {
            return Err(GatewayError::NoActiveConnection);
        }
        Ok(registry.primary.clone())
    }

    /// Reserve a generated `user@host` alias, suffixing `-2`, `-3`, ... on
    /// collision. The reservation is inserted under the registry write lock,
    /// so concurrent generators can never hand out the same name.
    fn reserve_generated(&self, username: &str, host: &str) -> Result<String, GatewayError> {
        let base = format!("{}@{}", username, host);
        let mut registry = self.state.write();

        if !registry.connections.contains_key(&base) {
            registry.connections.insert(base.clone(), Slot::Reserved);
            return Ok(base);
        }

        for i in 2..=MAX_ALIAS_SUFFIX {
            let candidate = format!("{}-{}", base, i);
            if !registry.connections.contains_key(&candidate) {
                registry
                    .connections
                    .insert(candidate.clone(), Slot::Reserved);
                return Ok(candidate);
            }
        }

        Err(GatewayError::Validation(format!(
            "unable to allocate an alias for {}: all {} suffixes taken",
            base, MAX_ALIAS_SUFFIX
        )))
    }

    fn alias_lock(&self, alias: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(alias.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn live(&self, alias: &str) -> Result<Arc<Connection>, GatewayError> {
        let registry = self.state.read();
        match registry.connections.get(alias) {
            Some(Slot::Live(conn)) => Ok(conn.clone()),
            _ => Err(GatewayError::NoSuchAlias(alias.to_string())),
        }
    }

    /// Resolve the jump connection for a reconnect, if the connection was
    /// dialed through one. A disconnected jump is an error.
    fn jump_for(&self, conn: &Arc<Connection>) -> Result<Option<Arc<Connection>>, GatewayError> {
        match conn.via() {
            None => Ok(None),
            Some(via) => self
                .live(via)
                .map(Some)
                .map_err(|_| {
                    GatewayError::Transport(format!("jump host '{}' not connected", via))
                }),
        }
    }
}

/// Merge a run result into a single model-facing string: stdout, then
/// stderr, `(No output)` when both are empty, a trailing `[Exit Code: N]`
/// for non-zero exits, truncated at `limit` bytes with a visible marker.
fn shape_output(output: &RunOutput, limit: usize) -> String {
    let mut shaped = String::new();
    if !output.stdout.is_empty() {
        shaped.push_str(&output.stdout);
    }
    if !output.stderr.is_empty() {
        if !shaped.is_empty() {
            shaped.push('\n');
        }
        shaped.push_str(&output.stderr);
    }

    if shaped.is_empty() {
        return "(No output)".to_string();
    }

    if output.exit_code != 0 {
        shaped.push_str(&format!("\n[Exit Code: {}]", output.exit_code));
    }

    if shaped.len() > limit {
        let mut end = limit;
        while !shaped.is_char_boundary(end) {
            end -= 1;
        }
        shaped.truncate(end);
        shaped.push_str("\n... [Output truncated]");
    }

    shaped
}

fn sudo_prefix_for(username: &str) -> &'static str {
    if username == "root" { "" } else { "sudo " }
}

/// Apply an edit operation to file content, returning the new content and
/// the number of replacements.
fn apply_edit(content: &str, op: &EditOp) -> Result<(String, usize), GatewayError> {
    match op {
        EditOp::Replace { old, new, all } => {
            if old.is_empty() {
                return Err(GatewayError::Validation(
                    "'old_text' must not be empty".into(),
                ));
            }
            let count = content.matches(old.as_str()).count();
            if count == 0 {
                return Err(GatewayError::Validation(format!(
                    "text not found: {:?}",
                    old
                )));
            }
            if *all {
                Ok((content.replace(old.as_str(), new), count))
            } else {
                Ok((content.replacen(old.as_str(), new, 1), 1))
            }
        }
        EditOp::Pattern {
            pattern,
            replacement,
            all,
        } => {
            let re = Regex::new(pattern)
                .map_err(|e| GatewayError::Validation(format!("invalid pattern: {}", e)))?;
            let count = re.find_iter(content).count();
            if count == 0 {
                return Err(GatewayError::Validation(format!(
                    "pattern matched nothing: {:?}",
                    pattern
                )));
            }
            if *all {
                Ok((re.replace_all(content, replacement.as_str()).into_owned(), count))
            } else {
                Ok((re.replace(content, replacement.as_str()).into_owned(), 1))
            }
        }
    }
}

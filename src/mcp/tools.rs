//! The MCP tool surface.
//!
//! One [`GatewayTools`] instance exists per MCP session; it captures the
//! tenant identity resolved at transport time and asks the pool for that
//! tenant's manager on every call. Every remote-touching tool takes a
//! `target` argument where blank or `"primary"` selects the manager's
//! current primary alias.
//!
//! Tools:
//!
//! - `connect` / `disconnect` / `list_connections`: connection lifecycle
//! - `run`: shell execution with CWD tracking and shaped output
//! - `identity`: the gateway's public key for `authorized_keys`
//! - `info`: one-shot system summary of a remote host
//! - `read` / `write` / `edit` / `list_dir`: SFTP file operations
//! - `sync`: stream a file between two connected hosts

use std::sync::Arc;

use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use tracing::{error, info};

use super::config::resolve_run_timeout;
use super::manager::{ConnectOptions, EditOp, Manager};
use super::pool::{Pool, Tenant};
use super::types::{ConnectResponse, ConnectionListResponse, DirListing};

/// Per-session tool handler bound to one tenant.
pub struct GatewayTools {
    pool: Arc<Pool>,
    tenant: Tenant,
}

impl GatewayTools {
    /// Bind a tool handler to a tenant, registering session tenants with
    /// the pool.
    pub fn new(pool: Arc<Pool>, tenant: Tenant) -> Self {
        if let Tenant::Session(id) = &tenant {
            pool.create_session(id);
        }
        Self { pool, tenant }
    }

    fn manager(&self) -> Result<Arc<Manager>, String> {
        self.pool
            .get(&self.tenant)
            .ok_or_else(|| "No active session".to_string())
    }
}

impl Drop for GatewayTools {
    fn drop(&mut self) {
        // A session tenant's manager lives exactly as long as its transport
        // session; header tenants are owned by the pool's reaper instead.
        if let Tenant::Session(id) = &self.tenant {
            self.pool.destroy_session(id);
        }
    }
}

#[Tools]
impl GatewayTools {
    /// Establish an SSH connection to a remote host and return its alias.
    ///
    /// Authentication uses exactly one method: the private key file if
    /// given, else the password if given, else the gateway's own identity
    /// (see the `identity` tool for the public key to authorize).
    ///
    /// The first successful connection becomes the "primary" target used by
    /// other tools when `target` is omitted.
    #[allow(clippy::too_many_arguments)]
    async fn connect(
        &self,
        /// Hostname or IP address
        host: String,
        /// SSH username
        username: String,
        /// SSH port (default: 22)
        port: Option<u16>,
        /// Password authentication (optional if using a key)
        password: Option<String>,
        /// Path to a private key file readable by the gateway
        private_key_path: Option<String>,
        /// Connection alias (auto-generated as user@host if omitted)
        alias: Option<String>,
        /// Alias of an already-connected jump host to tunnel through
        via: Option<String>,
    ) -> Result<StructuredContent<ConnectResponse>, String> {
        let mgr = self.manager()?;
        let port_value = port.unwrap_or(22);
        info!(tenant = %self.tenant, user = %username, host = %host, port = port_value, "connect");

        let opts = ConnectOptions {
            host: host.clone(),
            port,
            username: username.clone(),
            password,
            key_path: private_key_path,
            alias,
            via: via.clone(),
        };

        let assigned = mgr.connect(opts).await.map_err(|e| {
            error!(tenant = %self.tenant, error = %e, "connect failed");
            e.to_string()
        })?;

        let message = format!("Connected to {}@{} (alias: {})", username, host, assigned);
        Ok(StructuredContent(ConnectResponse {
            alias: assigned,
            username,
            host,
            port: port_value,
            via: via.filter(|v| !v.is_empty()),
            message,
        }))
    }

    /// Close an SSH connection, or all of them when no alias is given.
    async fn disconnect(
        &self,
        /// Connection alias to disconnect (all connections if omitted)
        alias: Option<String>,
    ) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        info!(tenant = %self.tenant, alias = ?alias, "disconnect");
        let message = mgr
            .disconnect(alias.as_deref())
            .await
            .map_err(|e| e.to_string())?;
        Ok(Text(message))
    }

    /// Execute a shell command on a remote host.
    ///
    /// The working directory persists across calls on the same alias, so
    /// `cd /srv && ls` followed by `pwd` behaves like one shell. Stdout and
    /// stderr are merged, a non-zero exit code is appended, and output is
    /// truncated at the configured byte limit.
    async fn run(
        &self,
        /// Shell command to execute
        command: String,
        /// Connection alias (default: primary)
        target: Option<String>,
        /// Command timeout in seconds (default: 120)
        timeout_secs: Option<u64>,
    ) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        let target = target.unwrap_or_default();
        let timeout = resolve_run_timeout(timeout_secs);
        info!(tenant = %self.tenant, target = %target, command = %command, "run");

        let output = mgr
            .execute(&command, &target, timeout)
            .await
            .map_err(|e| {
                error!(tenant = %self.tenant, error = %e, "run failed");
                e.to_string()
            })?;
        Ok(Text(output))
    }

    /// Get the gateway's public SSH key for remote `authorized_keys` files.
    async fn identity(&self) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        let public_key = mgr.public_key().map_err(|e| e.to_string())?;
        Ok(Text(format!(
            "SSH Public Key:\n\n```\n{}```\n\nAdd this to ~/.ssh/authorized_keys on remote servers.",
            public_key
        )))
    }

    /// Get remote system information (hostname, OS, kernel, architecture).
    async fn info(
        &self,
        /// Connection alias (default: primary)
        target: Option<String>,
    ) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        let target = target.unwrap_or_default();

        let cmd = r#"echo "Hostname: $(hostname)"; echo "OS: $(cat /etc/os-release 2>/dev/null | grep PRETTY_NAME | cut -d'"' -f2 || uname -s)"; echo "Kernel: $(uname -r)"; echo "Arch: $(uname -m)"; echo "Shell: $SHELL""#;
        let output = mgr
            .execute(cmd, &target, resolve_run_timeout(None))
            .await
            .map_err(|e| e.to_string())?;
        Ok(Text(output))
    }

    /// List this tenant's live connections and their working directories.
    async fn list_connections(&self) -> Result<StructuredContent<ConnectionListResponse>, String> {
        let mgr = self.manager()?;
        let connections = mgr.list_connections().await;
        let count = connections.len();
        Ok(StructuredContent(ConnectionListResponse {
            connections,
            count,
        }))
    }

    /// Read the contents of a remote file.
    ///
    /// Relative paths resolve against the connection's current working
    /// directory.
    async fn read(
        &self,
        /// File path to read
        path: String,
        /// Connection alias (default: primary)
        target: Option<String>,
    ) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        let target = target.unwrap_or_default();
        let content = mgr.read_file(&path, &target).await.map_err(|e| {
            error!(tenant = %self.tenant, path = %path, error = %e, "read failed");
            e.to_string()
        })?;
        Ok(Text(content))
    }

    /// Write content to a remote file, creating or truncating it.
    async fn write(
        &self,
        /// File path to write
        path: String,
        /// Content to write
        content: String,
        /// Connection alias (default: primary)
        target: Option<String>,
    ) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        let target = target.unwrap_or_default();
        let bytes = content.len();
        let resolved = mgr
            .write_file(&path, &content, &target)
            .await
            .map_err(|e| {
                error!(tenant = %self.tenant, path = %path, error = %e, "write failed");
                e.to_string()
            })?;
        Ok(Text(format!(
            "Successfully wrote {} bytes to {}",
            bytes, resolved
        )))
    }

    /// Edit a remote file in place.
    ///
    /// Two modes: literal find-and-replace (`old_text` / `new_text`) or
    /// regular-expression replace (`pattern` / `replacement`, `$1` for
    /// capture groups). The file is read, modified in memory and written
    /// back, so the edit is not atomic against concurrent external writers.
    #[allow(clippy::too_many_arguments)]
    async fn edit(
        &self,
        /// File path to edit
        path: String,
        /// Literal text to find (literal mode)
        old_text: Option<String>,
        /// Replacement for old_text (literal mode)
        new_text: Option<String>,
        /// Regular expression to match (pattern mode)
        pattern: Option<String>,
        /// Replacement for pattern matches, supports $1 backrefs (pattern mode)
        replacement: Option<String>,
        /// Replace every occurrence (default: false for literal, true for pattern)
        all: Option<bool>,
        /// Connection alias (default: primary)
        target: Option<String>,
    ) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        let target = target.unwrap_or_default();

        let op = if let Some(old) = old_text {
            EditOp::Replace {
                old,
                new: new_text.unwrap_or_default(),
                all: all.unwrap_or(false),
            }
        } else if let Some(pattern) = pattern {
            EditOp::Pattern {
                pattern,
                replacement: replacement.unwrap_or_default(),
                all: all.unwrap_or(true),
            }
        } else {
            return Err("either 'old_text' or 'pattern' is required".to_string());
        };

        let (resolved, count) = mgr.edit_file(&path, &op, &target).await.map_err(|e| {
            error!(tenant = %self.tenant, path = %path, error = %e, "edit failed");
            e.to_string()
        })?;
        Ok(Text(format!(
            "Applied {} replacement(s) to {}",
            count, resolved
        )))
    }

    /// List the contents of a remote directory.
    async fn list_dir(
        &self,
        /// Directory path to list
        path: String,
        /// Connection alias (default: primary)
        target: Option<String>,
    ) -> Result<StructuredContent<DirListing>, String> {
        let mgr = self.manager()?;
        let target = target.unwrap_or_default();
        let entries = mgr
            .list_dir(&path, &target)
            .await
            .map_err(|e| e.to_string())?;
        let count = entries.len();
        Ok(StructuredContent(DirListing {
            path,
            entries,
            count,
        }))
    }

    /// Stream a file directly between two connected hosts.
    ///
    /// Reads via SFTP on the source alias and writes via SFTP on the
    /// destination alias without staging the file on the gateway disk.
    async fn sync(
        &self,
        /// Source connection alias
        source: String,
        /// Source file path
        source_path: String,
        /// Destination connection alias
        dest: String,
        /// Destination file path
        dest_path: String,
    ) -> Result<Text<String>, String> {
        let mgr = self.manager()?;
        info!(
            tenant = %self.tenant,
            source = %source, dest = %dest, "sync"
        );
        let bytes = mgr
            .sync_file(&source, &source_path, &dest, &dest_path)
            .await
            .map_err(|e| {
                error!(tenant = %self.tenant, error = %e, "sync failed");
                e.to_string()
            })?;
        Ok(Text(format!(
            "Successfully synced {} bytes from {} to {}",
            bytes, source, dest
        )))
    }
}

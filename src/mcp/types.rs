//! Serializable response types for the MCP tool surface.
//!
//! Everything here derives `Serialize`, `Deserialize` and `JsonSchema` so
//! the MCP layer can publish structured output schemas.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Result of a successful `connect` call.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectResponse {
    /// The alias assigned to the connection (possibly auto-generated).
    pub alias: String,
    pub username: String,
    pub host: String,
    pub port: u16,
    /// Jump-host alias the connection tunnels through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    pub message: String,
}

/// One live connection, as reported by `list_connections`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionInfo {
    pub alias: String,
    pub username: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    /// Working directory after the last command on this alias.
    pub cwd: String,
    /// Whether this alias is the manager's current default target.
    pub primary: bool,
    /// RFC3339 timestamp of the initial connect.
    pub connected_at: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionListResponse {
    pub connections: Vec<ConnectionInfo>,
    pub count: usize,
}

/// One directory entry, as reported by `list_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileEntry {
    pub name: String,
    /// `"file"` or `"dir"`.
    #[serde(rename = "type")]
    pub file_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Unix permission string, e.g. `-rw-r--r--`.
    pub permissions: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DirListing {
    /// The resolved directory path.
    pub path: String,
    pub entries: Vec<FileEntry>,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_entry_uses_type_key() {
        let entry = FileEntry {
            name: "app.log".into(),
            file_type: "file".into(),
            size: 2048,
            permissions: "-rw-r--r--".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["size"], 2048);
        assert!(json.get("file_type").is_none());
    }

    #[test]
    fn test_connect_response_omits_absent_via() {
        let response = ConnectResponse {
            alias: "admin@web-1".into(),
            username: "admin".into(),
            host: "web-1".into(),
            port: 22,
            via: None,
            message: "Connected".into(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("\"via\""));

        let parsed: ConnectResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.alias, "admin@web-1");
        assert_eq!(parsed.via, None);
    }

    #[test]
    fn test_connection_info_round_trip() {
        let info = ConnectionInfo {
            alias: "db".into(),
            username: "postgres".into(),
            host: "10.0.0.7".into(),
            port: 2222,
            via: Some("bastion".into()),
            cwd: "/var/lib/postgresql".into(),
            primary: true,
            connected_at: "2026-03-02T10:30:00Z".into(),
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ConnectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.via.as_deref(), Some("bastion"));
        assert!(parsed.primary);
    }
}

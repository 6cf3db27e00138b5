//! Authentication with the gateway's own identity.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::mcp::connection::AcceptAllHosts;
use crate::mcp::error::GatewayError;
use crate::mcp::keys::KeyStore;

use super::traits::AuthStrategy;

/// Authenticates with the Ed25519 key pair managed by the [`KeyStore`].
///
/// Used when the caller supplies neither a password nor a key file; the
/// remote host must already list the gateway's public key in
/// `authorized_keys` (see the `identity` tool).
pub(crate) struct SystemKeyAuth {
    key_store: Arc<KeyStore>,
}

impl SystemKeyAuth {
    pub(crate) fn new(key_store: Arc<KeyStore>) -> Self {
        Self { key_store }
    }
}

#[async_trait]
impl AuthStrategy for SystemKeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<AcceptAllHosts>,
        username: &str,
    ) -> Result<bool, GatewayError> {
        let key_pair = self.key_store.load_private().map_err(|e| {
            GatewayError::Auth(format!("no credentials given and system key unavailable: {}", e))
        })?;

        debug!("authenticating with system key");
        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), None);
        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| GatewayError::Auth(format!("system key authentication failed: {}", e)))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "system-key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        let auth = SystemKeyAuth::new(Arc::new(KeyStore::new(Some("./data"))));
        assert_eq!(auth.name(), "system-key");
    }
}

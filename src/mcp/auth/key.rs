//! Private key file authentication.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::mcp::connection::AcceptAllHosts;
use crate::mcp::error::GatewayError;

use super::traits::AuthStrategy;

/// Authenticates with a caller-supplied private key file.
///
/// Passphrase-protected keys are not supported; the file must be readable by
/// the gateway process.
pub(crate) struct KeyFileAuth {
    key_path: PathBuf,
}

impl KeyFileAuth {
    pub(crate) fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyFileAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<AcceptAllHosts>,
        username: &str,
    ) -> Result<bool, GatewayError> {
        let key_pair = keys::load_secret_key(&self.key_path, None).map_err(|e| {
            GatewayError::Auth(format!(
                "failed to load private key from {}: {}",
                self.key_path.display(),
                e
            ))
        })?;

        // For RSA keys, pick the best hash algorithm the server supports.
        let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        debug!(?hash_alg, "public key authentication");

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| GatewayError::Auth(format!("key authentication failed: {}", e)))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key-file"
    }
}

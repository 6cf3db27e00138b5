//! Authentication strategy trait.

use async_trait::async_trait;
use russh::client;

use crate::mcp::connection::AcceptAllHosts;
use crate::mcp::error::GatewayError;

/// One SSH authentication method.
///
/// Implementations must be thread-safe; a strategy is used once per
/// connection (or reconnection) attempt.
#[async_trait]
pub(crate) trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate against the server.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` when the server rejected
    /// the credential, and `Err` when the attempt itself failed.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<AcceptAllHosts>,
        username: &str,
    ) -> Result<bool, GatewayError>;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

//! Password authentication.

use async_trait::async_trait;
use russh::client;

use crate::mcp::connection::AcceptAllHosts;
use crate::mcp::error::GatewayError;

use super::traits::AuthStrategy;

pub(crate) struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub(crate) fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<AcceptAllHosts>,
        username: &str,
    ) -> Result<bool, GatewayError> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| GatewayError::Auth(format!("password authentication failed: {}", e)))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        assert_eq!(PasswordAuth::new("hunter2").name(), "password");
    }

    #[test]
    fn test_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PasswordAuth>();
    }
}

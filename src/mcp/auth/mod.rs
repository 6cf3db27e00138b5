//! SSH authentication strategies.
//!
//! Exactly one method is offered per connection attempt:
//!
//! 1. an explicit private key file, when the caller provided one;
//! 2. else the caller's password, when provided;
//! 3. else the gateway's own system identity from the [`KeyStore`].
//!
//! The methods are never combined - offering a caller-supplied credential
//! alongside the system key would blur whose identity a connection runs as.

mod key;
mod password;
mod system;
mod traits;

use std::sync::Arc;

pub(crate) use key::KeyFileAuth;
pub(crate) use password::PasswordAuth;
pub(crate) use system::SystemKeyAuth;
pub(crate) use traits::AuthStrategy;

use super::keys::KeyStore;

/// Pick the single strategy for this connection attempt.
pub(crate) fn select_strategy(
    password: Option<&str>,
    key_path: Option<&str>,
    key_store: &Arc<KeyStore>,
) -> Box<dyn AuthStrategy> {
    if let Some(path) = key_path {
        Box::new(KeyFileAuth::new(path))
    } else if let Some(password) = password {
        Box::new(PasswordAuth::new(password))
    } else {
        Box::new(SystemKeyAuth::new(key_store.clone()))
    }
}

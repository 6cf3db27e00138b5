//! Configuration resolution for the gateway.
//!
//! Values are resolved with a three-tier priority:
//!
//! 1. **Parameter** - explicit CLI flag or tool argument (highest priority)
//! 2. **Environment variable**
//! 3. **Default** - built-in value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_MCP_MODE` | `http` | Transport mode: `stdio` or `http` |
//! | `PORT` | 8000 | TCP port in `http` mode |
//! | `SSH_MCP_DEBUG` | false | Verbose log formatting |
//! | `SSH_MCP_GLOBAL` | false | Single shared manager for all clients |
//! | `SSH_MCP_KEY_DIR` | auto | Key directory (`/data` or `./data`) |
//! | `SSH_MCP_CONNECT_TIMEOUT` | 30s | SSH dial + handshake timeout |
//! | `SSH_MCP_RUN_TIMEOUT` | 120s | Default command execution timeout |
//! | `SSH_MCP_IDLE_TIMEOUT` | 300s | Idle time before a tenant is reaped |
//! | `SSH_MCP_MAX_OUTPUT` | 51200 | Byte limit for shaped command output |
//! | `SSH_MCP_DIAL_RETRIES` | 2 | Retries for transient dial failures |

use std::env;
use std::time::Duration;

/// Header that selects sticky (header-keyed) tenant routing in HTTP mode.
pub const SESSION_KEY_HEADER: &str = "X-Session-Key";

/// Default transport mode.
pub(crate) const DEFAULT_MODE: &str = "http";

/// Default HTTP port.
pub(crate) const DEFAULT_PORT: u16 = 8000;

/// Default SSH dial + handshake timeout in seconds.
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds.
pub(crate) const DEFAULT_RUN_TIMEOUT_SECS: u64 = 120;

/// Default idle timeout before a header-keyed tenant is reaped, in seconds.
pub(crate) const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default byte limit applied when shaping command output for the model.
pub(crate) const DEFAULT_MAX_OUTPUT_BYTES: usize = 51200;

/// Default retry attempts for transient dial failures.
pub(crate) const DEFAULT_DIAL_RETRIES: u32 = 2;

/// Maximum backoff delay between dial retries.
pub(crate) const MAX_DIAL_RETRY_DELAY: Duration = Duration::from_secs(10);

pub const MODE_ENV_VAR: &str = "SSH_MCP_MODE";
pub const PORT_ENV_VAR: &str = "PORT";
pub const DEBUG_ENV_VAR: &str = "SSH_MCP_DEBUG";
pub const GLOBAL_ENV_VAR: &str = "SSH_MCP_GLOBAL";
pub const KEY_DIR_ENV_VAR: &str = "SSH_MCP_KEY_DIR";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_MCP_CONNECT_TIMEOUT";
pub(crate) const RUN_TIMEOUT_ENV_VAR: &str = "SSH_MCP_RUN_TIMEOUT";
pub(crate) const IDLE_TIMEOUT_ENV_VAR: &str = "SSH_MCP_IDLE_TIMEOUT";
pub(crate) const MAX_OUTPUT_ENV_VAR: &str = "SSH_MCP_MAX_OUTPUT";
pub(crate) const DIAL_RETRIES_ENV_VAR: &str = "SSH_MCP_DIAL_RETRIES";

/// Resolve the transport mode: flag -> env -> default.
pub fn resolve_mode(flag: Option<String>) -> String {
    if let Some(mode) = flag {
        return mode;
    }
    env::var(MODE_ENV_VAR).unwrap_or_else(|_| DEFAULT_MODE.to_string())
}

/// Resolve the HTTP port: flag -> env -> default.
pub fn resolve_port(flag: Option<u16>) -> u16 {
    if let Some(port) = flag {
        return port;
    }
    if let Ok(env_port) = env::var(PORT_ENV_VAR)
        && let Ok(port) = env_port.parse::<u16>()
    {
        return port;
    }
    DEFAULT_PORT
}

/// Resolve a boolean option: flag -> env -> default (false).
///
/// Environment values `true` (any case) and `1` count as true.
pub fn resolve_bool(flag: bool, env_var: &str) -> bool {
    if flag {
        return true;
    }
    if let Ok(value) = env::var(env_var) {
        return value.eq_ignore_ascii_case("true") || value == "1";
    }
    false
}

/// Resolve the key directory override: flag -> env -> none (auto-detect).
pub fn resolve_key_dir(flag: Option<String>) -> Option<String> {
    if flag.is_some() {
        return flag;
    }
    env::var(KEY_DIR_ENV_VAR).ok().filter(|s| !s.is_empty())
}

/// Resolve the SSH dial timeout: env -> default.
pub(crate) fn resolve_connect_timeout() -> Duration {
    Duration::from_secs(resolve_secs(
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

/// Resolve the command timeout: tool parameter -> env -> default.
pub(crate) fn resolve_run_timeout(timeout_param: Option<u64>) -> Duration {
    if let Some(secs) = timeout_param {
        return Duration::from_secs(secs);
    }
    Duration::from_secs(resolve_secs(RUN_TIMEOUT_ENV_VAR, DEFAULT_RUN_TIMEOUT_SECS))
}

/// Resolve the tenant idle timeout: env -> default.
pub(crate) fn resolve_idle_timeout() -> Duration {
    Duration::from_secs(resolve_secs(
        IDLE_TIMEOUT_ENV_VAR,
        DEFAULT_IDLE_TIMEOUT_SECS,
    ))
}

/// Resolve the output byte limit: env -> default.
pub(crate) fn resolve_max_output() -> usize {
    if let Ok(value) = env::var(MAX_OUTPUT_ENV_VAR)
        && let Ok(limit) = value.parse::<usize>()
    {
        return limit;
    }
    DEFAULT_MAX_OUTPUT_BYTES
}

/// Resolve the dial retry count: env -> default.
pub(crate) fn resolve_dial_retries() -> u32 {
    if let Ok(value) = env::var(DIAL_RETRIES_ENV_VAR)
        && let Ok(retries) = value.parse::<u32>()
    {
        return retries;
    }
    DEFAULT_DIAL_RETRIES
}

fn resolve_secs(env_var: &str, default: u64) -> u64 {
    if let Ok(value) = env::var(env_var)
        && let Ok(secs) = value.parse::<u64>()
    {
        return secs;
    }
    default
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Serialize env-var tests to avoid races between them.
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: must be called while holding ENV_TEST_MUTEX.
    unsafe fn set_env(key: &str, value: &str) {
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: must be called while holding ENV_TEST_MUTEX.
    unsafe fn remove_env(key: &str) {
        unsafe { env::remove_var(key) };
    }

    mod mode {
        use super::*;

        #[test]
        fn test_flag_takes_priority() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(MODE_ENV_VAR, "stdio") };
            let mode = resolve_mode(Some("http".to_string()));
            unsafe { remove_env(MODE_ENV_VAR) };
            assert_eq!(mode, "http");
        }

        #[test]
        fn test_env_used_when_no_flag() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(MODE_ENV_VAR, "stdio") };
            let mode = resolve_mode(None);
            unsafe { remove_env(MODE_ENV_VAR) };
            assert_eq!(mode, "stdio");
        }

        #[test]
        fn test_default_is_http() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(MODE_ENV_VAR) };
            assert_eq!(resolve_mode(None), "http");
        }
    }

    mod port {
        use super::*;

        #[test]
        fn test_flag_takes_priority() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(PORT_ENV_VAR, "9000") };
            let port = resolve_port(Some(7000));
            unsafe { remove_env(PORT_ENV_VAR) };
            assert_eq!(port, 7000);
        }

        #[test]
        fn test_env_used_when_no_flag() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(PORT_ENV_VAR, "9000") };
            let port = resolve_port(None);
            unsafe { remove_env(PORT_ENV_VAR) };
            assert_eq!(port, 9000);
        }

        #[test]
        fn test_invalid_env_falls_back_to_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(PORT_ENV_VAR, "not-a-port") };
            let port = resolve_port(None);
            unsafe { remove_env(PORT_ENV_VAR) };
            assert_eq!(port, DEFAULT_PORT);
        }

        #[test]
        fn test_default_is_8000() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(PORT_ENV_VAR) };
            assert_eq!(resolve_port(None), 8000);
        }
    }

    mod booleans {
        use super::*;

        #[test]
        fn test_flag_wins() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(GLOBAL_ENV_VAR) };
            assert!(resolve_bool(true, GLOBAL_ENV_VAR));
        }

        #[test]
        fn test_env_true_variants() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            for value in ["true", "TRUE", "TrUe", "1"] {
                unsafe { set_env(DEBUG_ENV_VAR, value) };
                assert!(resolve_bool(false, DEBUG_ENV_VAR), "value {value:?}");
            }
            unsafe { remove_env(DEBUG_ENV_VAR) };
        }

        #[test]
        fn test_env_other_values_are_false() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            for value in ["false", "0", "yes", ""] {
                unsafe { set_env(DEBUG_ENV_VAR, value) };
                assert!(!resolve_bool(false, DEBUG_ENV_VAR), "value {value:?}");
            }
            unsafe { remove_env(DEBUG_ENV_VAR) };
        }

        #[test]
        fn test_default_is_false() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(GLOBAL_ENV_VAR) };
            assert!(!resolve_bool(false, GLOBAL_ENV_VAR));
        }
    }

    mod timeouts {
        use super::*;

        #[test]
        fn test_run_timeout_param_takes_priority() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(RUN_TIMEOUT_ENV_VAR, "300") };
            let timeout = resolve_run_timeout(Some(45));
            unsafe { remove_env(RUN_TIMEOUT_ENV_VAR) };
            assert_eq!(timeout, Duration::from_secs(45));
        }

        #[test]
        fn test_run_timeout_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(RUN_TIMEOUT_ENV_VAR, "300") };
            let timeout = resolve_run_timeout(None);
            unsafe { remove_env(RUN_TIMEOUT_ENV_VAR) };
            assert_eq!(timeout, Duration::from_secs(300));
        }

        #[test]
        fn test_run_timeout_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(RUN_TIMEOUT_ENV_VAR) };
            assert_eq!(
                resolve_run_timeout(None),
                Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS)
            );
        }

        #[test]
        fn test_idle_timeout_default_is_five_minutes() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(IDLE_TIMEOUT_ENV_VAR) };
            assert_eq!(resolve_idle_timeout(), Duration::from_secs(300));
        }

        #[test]
        fn test_connect_timeout_ignores_garbage() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(CONNECT_TIMEOUT_ENV_VAR, "soon") };
            let timeout = resolve_connect_timeout();
            unsafe { remove_env(CONNECT_TIMEOUT_ENV_VAR) };
            assert_eq!(timeout, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
        }
    }

    mod limits {
        use super::*;

        #[test]
        fn test_max_output_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(MAX_OUTPUT_ENV_VAR) };
            assert_eq!(resolve_max_output(), 51200);
        }

        #[test]
        fn test_max_output_env_override() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(MAX_OUTPUT_ENV_VAR, "1024") };
            let limit = resolve_max_output();
            unsafe { remove_env(MAX_OUTPUT_ENV_VAR) };
            assert_eq!(limit, 1024);
        }

        #[test]
        fn test_dial_retries_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { remove_env(DIAL_RETRIES_ENV_VAR) };
            assert_eq!(resolve_dial_retries(), DEFAULT_DIAL_RETRIES);
        }
    }

    mod key_dir {
        use super::*;

        #[test]
        fn test_flag_takes_priority() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(KEY_DIR_ENV_VAR, "/env/keys") };
            let dir = resolve_key_dir(Some("/flag/keys".to_string()));
            unsafe { remove_env(KEY_DIR_ENV_VAR) };
            assert_eq!(dir.as_deref(), Some("/flag/keys"));
        }

        #[test]
        fn test_env_used_when_no_flag() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(KEY_DIR_ENV_VAR, "/env/keys") };
            let dir = resolve_key_dir(None);
            unsafe { remove_env(KEY_DIR_ENV_VAR) };
            assert_eq!(dir.as_deref(), Some("/env/keys"));
        }

        #[test]
        fn test_empty_env_is_ignored() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            unsafe { set_env(KEY_DIR_ENV_VAR, "") };
            let dir = resolve_key_dir(None);
            unsafe { remove_env(KEY_DIR_ENV_VAR) };
            assert_eq!(dir, None);
        }
    }
}

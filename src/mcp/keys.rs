//! The gateway's own SSH identity.
//!
//! A long-lived Ed25519 key pair persisted under a configurable directory.
//! When the caller supplies neither a password nor an explicit private key,
//! connections authenticate with this identity; the `identity` tool exposes
//! the public half so an operator can paste it into a remote
//! `authorized_keys`.
//!
//! Directory selection mirrors the deployment layout: `/data` when it exists
//! (container with a mounted volume), `./data` for local development. The
//! production directory must already exist; the development directory is
//! created on demand with owner-only permissions.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, load_secret_key};
use tracing::info;

use super::error::GatewayError;

/// Container deployment location for the key pair.
pub(crate) const PRODUCTION_KEY_DIR: &str = "/data";

/// Local development location for the key pair.
pub(crate) const DEV_KEY_DIR: &str = "./data";

/// File name of the private key inside the key directory.
const KEY_FILE_NAME: &str = "id_ed25519";

/// Comment attached to the generated key, identifying it in remote
/// `authorized_keys` files.
const KEY_COMMENT: &str = "ssh-fleet-mcp";

/// Loads, generates and serves the system key pair.
pub struct KeyStore {
    key_path: PathBuf,
}

impl KeyStore {
    /// Create a key store rooted at `dir`, or at the auto-detected default
    /// when `dir` is `None`.
    pub fn new(dir: Option<&str>) -> Self {
        let dir = match dir {
            Some(d) => PathBuf::from(d),
            None => PathBuf::from(default_key_dir()),
        };
        Self {
            key_path: dir.join(KEY_FILE_NAME),
        }
    }

    /// Ensure the key directory is usable and the key pair exists,
    /// generating a fresh Ed25519 pair if necessary.
    ///
    /// Fails when the production directory is missing (the volume must be
    /// mounted) or when the directory is not actually writable. Writability
    /// is probed with a real write-and-delete, not a permission-bit check.
    pub fn ensure(&self) -> Result<(), GatewayError> {
        let key_dir = self
            .key_path
            .parent()
            .ok_or_else(|| GatewayError::Config("key path has no parent directory".into()))?;

        match fs::metadata(key_dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(GatewayError::Config(format!(
                    "key path {} exists but is not a directory",
                    key_dir.display()
                )));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if key_dir == Path::new(PRODUCTION_KEY_DIR) {
                    return Err(GatewayError::Config(format!(
                        "production key directory {} does not exist - ensure the volume is mounted",
                        PRODUCTION_KEY_DIR
                    )));
                }
                fs::create_dir_all(key_dir)?;
                fs::set_permissions(key_dir, fs::Permissions::from_mode(0o700))?;
                info!(dir = %key_dir.display(), "created key directory");
            }
            Err(err) => {
                return Err(GatewayError::Config(format!(
                    "failed to access key directory {}: {}",
                    key_dir.display(),
                    err
                )));
            }
        }

        // Probe with an actual write: mode bits do not always reflect
        // effective write capability (read-only mounts, ACLs).
        let probe = key_dir.join(".write_test");
        fs::write(&probe, b"test").map_err(|err| {
            GatewayError::Config(format!(
                "key directory {} is not writable: {}",
                key_dir.display(),
                err
            ))
        })?;
        let _ = fs::remove_file(&probe);

        if self.key_path.exists() {
            info!(path = %self.key_path.display(), "using existing system key");
            return Ok(());
        }

        info!(path = %self.key_path.display(), "generating new Ed25519 key pair");
        self.generate()
    }

    /// Generate the Ed25519 pair and write both halves to disk.
    fn generate(&self) -> Result<(), GatewayError> {
        let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| GatewayError::Key(format!("failed to generate key: {}", e)))?;
        key.set_comment(KEY_COMMENT);

        let private_pem = key
            .to_openssh(LineEnding::LF)
            .map_err(|e| GatewayError::Key(format!("failed to encode private key: {}", e)))?;
        fs::write(&self.key_path, private_pem.as_bytes())?;
        fs::set_permissions(&self.key_path, fs::Permissions::from_mode(0o600))?;

        let public_line = key
            .public_key()
            .to_openssh()
            .map_err(|e| GatewayError::Key(format!("failed to encode public key: {}", e)))?;
        let pub_path = self.public_key_path();
        fs::write(&pub_path, format!("{}\n", public_line))?;
        fs::set_permissions(&pub_path, fs::Permissions::from_mode(0o644))?;

        info!("system key generated");
        Ok(())
    }

    /// Load the private key for authentication.
    pub fn load_private(&self) -> Result<PrivateKey, GatewayError> {
        load_secret_key(&self.key_path, None).map_err(|e| {
            GatewayError::Key(format!(
                "failed to load private key from {}: {}",
                self.key_path.display(),
                e
            ))
        })
    }

    /// The public half in OpenSSH `authorized_keys` format.
    pub fn public_key(&self) -> Result<String, GatewayError> {
        fs::read_to_string(self.public_key_path()).map_err(|e| {
            GatewayError::Key(format!(
                "failed to read public key from {}: {}",
                self.public_key_path().display(),
                e
            ))
        })
    }

    fn public_key_path(&self) -> PathBuf {
        let mut path = self.key_path.as_os_str().to_owned();
        path.push(".pub");
        PathBuf::from(path)
    }
}

/// Pick `/data` when it exists and is a directory, otherwise `./data`.
fn default_key_dir() -> &'static str {
    match fs::metadata(PRODUCTION_KEY_DIR) {
        Ok(meta) if meta.is_dir() => PRODUCTION_KEY_DIR,
        _ => DEV_KEY_DIR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> KeyStore {
        KeyStore::new(Some(dir.to_str().expect("utf-8 temp path")))
    }

    mod ensure {
        use super::*;

        #[test]
        fn test_generates_key_pair_in_fresh_directory() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = tmp.path().join("keys");
            let store = store_in(&dir);

            store.ensure().unwrap();

            assert!(dir.join("id_ed25519").exists());
            assert!(dir.join("id_ed25519.pub").exists());
        }

        #[test]
        fn test_private_key_mode_is_0600() {
            let tmp = tempfile::tempdir().unwrap();
            let store = store_in(tmp.path());
            store.ensure().unwrap();

            let mode = fs::metadata(tmp.path().join("id_ed25519"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        #[test]
        fn test_public_key_mode_is_0644() {
            let tmp = tempfile::tempdir().unwrap();
            let store = store_in(tmp.path());
            store.ensure().unwrap();

            let mode = fs::metadata(tmp.path().join("id_ed25519.pub"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }

        #[test]
        fn test_is_idempotent() {
            let tmp = tempfile::tempdir().unwrap();
            let store = store_in(tmp.path());

            store.ensure().unwrap();
            let first = fs::read(tmp.path().join("id_ed25519")).unwrap();

            store.ensure().unwrap();
            let second = fs::read(tmp.path().join("id_ed25519")).unwrap();

            // Second ensure must not regenerate the key.
            assert_eq!(first, second);
        }

        #[test]
        fn test_fails_when_dir_is_a_file() {
            let tmp = tempfile::tempdir().unwrap();
            let file_as_dir = tmp.path().join("notadir");
            fs::write(&file_as_dir, b"x").unwrap();

            let store = store_in(&file_as_dir);
            let err = store.ensure().unwrap_err();
            assert!(matches!(err, GatewayError::Config(_)));
        }

        #[test]
        fn test_fails_when_dir_is_not_writable() {
            let tmp = tempfile::tempdir().unwrap();
            let dir = tmp.path().join("ro");
            fs::create_dir(&dir).unwrap();
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o500)).unwrap();

            let store = store_in(&dir);
            let result = store.ensure();

            // Restore so the tempdir can be cleaned up.
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();

            let err = result.unwrap_err();
            assert!(matches!(err, GatewayError::Config(_)));
            assert!(err.to_string().contains("not writable"));
        }
    }

    mod key_material {
        use super::*;

        #[test]
        fn test_public_key_is_authorized_keys_format() {
            let tmp = tempfile::tempdir().unwrap();
            let store = store_in(tmp.path());
            store.ensure().unwrap();

            let public = store.public_key().unwrap();
            let mut fields = public.split_whitespace();
            assert_eq!(fields.next(), Some("ssh-ed25519"));
            assert!(fields.next().is_some_and(|blob| blob.len() > 40));
            assert_eq!(fields.next(), Some("ssh-fleet-mcp"));
            assert!(public.ends_with('\n'));
        }

        #[test]
        fn test_private_key_loads_and_matches_public() {
            let tmp = tempfile::tempdir().unwrap();
            let store = store_in(tmp.path());
            store.ensure().unwrap();

            let private = store.load_private().unwrap();
            let public_line = store.public_key().unwrap();
            let encoded = private.public_key().to_openssh().unwrap();
            assert_eq!(public_line.trim_end(), encoded);
        }

        #[test]
        fn test_public_key_missing_is_an_error() {
            let tmp = tempfile::tempdir().unwrap();
            let store = store_in(tmp.path());
            assert!(store.public_key().is_err());
        }
    }
}

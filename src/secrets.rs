//! In-memory secret store and askpass artifacts
//!
//! Passwords held for sudo delivery live encrypted under a per-instance
//! random key; plaintext exists only transiently at store/retrieve time
//! and never reaches logs or error messages. Askpass scripts are one-shot
//! files in the OS temp directory, tracked for cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Mask substituted for known secrets in log-bound strings.
pub const MASK: &str = "***MASKED***";

/// Encrypted in-memory secret store with askpass script management.
///
/// Disposal zeroes every stored buffer, deletes tracked scripts, and makes
/// the handler permanently unusable.
pub struct SecurePasswordHandler {
    /// Per-instance master key; per-secret keys derive from it.
    key: parking_lot::Mutex<[u8; KEY_LEN]>,
    /// id -> salt ∥ nonce ∥ ciphertext (tag appended by AES-GCM).
    secrets: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
    /// Askpass scripts awaiting cleanup.
    scripts: parking_lot::Mutex<Vec<PathBuf>>,
    disposed: AtomicBool,
}

impl SecurePasswordHandler {
    /// Handler with a fresh random master key.
    pub fn new() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            key: parking_lot::Mutex::new(key),
            secrets: parking_lot::Mutex::new(HashMap::new()),
            scripts: parking_lot::Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Secret("handler has been disposed".to_string()));
        }
        Ok(())
    }

    /// Derive the per-secret key from the master key and salt.
    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let master = self.key.lock();
        let mut hasher = Sha256::new();
        hasher.update(&master[..]);
        hasher.update(salt);
        let digest = hasher.finalize();
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        key
    }

    /// Encrypt and store a password under `id`, replacing any previous
    /// value for the same id.
    pub fn store_password(&self, id: &str, plaintext: &str) -> Result<()> {
        self.ensure_usable()?;

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| Error::Secret("invalid key length".to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Secret("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        self.secrets.lock().insert(id.to_string(), blob);
        debug!(id, "stored encrypted secret");
        Ok(())
    }

    /// Decrypt the password stored under `id`.
    pub fn retrieve_password(&self, id: &str) -> Result<String> {
        self.ensure_usable()?;

        let secrets = self.secrets.lock();
        let blob = secrets
            .get(id)
            .ok_or_else(|| Error::Secret(format!("no secret stored under id `{}`", id)))?;
        if blob.len() < SALT_LEN + NONCE_LEN {
            return Err(Error::Secret("stored secret is truncated".to_string()));
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| Error::Secret("invalid key length".to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Secret("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::Secret("decrypted secret is not UTF-8".to_string()))
    }

    /// Drop the secret stored under `id`, zeroing its buffer.
    pub fn remove_password(&self, id: &str) {
        if let Some(mut blob) = self.secrets.lock().remove(id) {
            blob.iter_mut().for_each(|b| *b = 0);
        }
    }

    /// Write a one-shot askpass script echoing `password`, mode 0700,
    /// under a random id in the OS temp directory. The path is tracked
    /// and removed on [`dispose`](Self::dispose) or
    /// [`cleanup_script`](Self::cleanup_script).
    pub fn create_askpass_script(&self, password: &str) -> Result<PathBuf> {
        self.ensure_usable()?;

        let path =
            std::env::temp_dir().join(format!("askpass-{}.sh", uuid::Uuid::new_v4().simple()));
        let script = format!("#!/bin/sh\necho '{}'\n", escape_single_quotes(password));
        std::fs::write(&path, script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }

        self.scripts.lock().push(path.clone());
        debug!(path = %path.display(), "wrote askpass script");
        Ok(path)
    }

    /// Remove one tracked askpass script. Missing files are not an error.
    pub fn cleanup_script(&self, path: &PathBuf) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove askpass script");
            }
        }
        self.scripts.lock().retain(|p| p != path);
    }

    /// Replace every occurrence of `password` in `text` with the mask.
    /// Applied to any string destined for logs or events.
    pub fn mask_password(text: &str, password: &str) -> String {
        if password.is_empty() {
            return text.to_string();
        }
        text.replace(password, MASK)
    }

    /// Zero every buffer, delete every tracked script, and mark the
    /// handler unusable. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut secrets = self.secrets.lock();
        for (_, blob) in secrets.iter_mut() {
            blob.iter_mut().for_each(|b| *b = 0);
        }
        secrets.clear();
        drop(secrets);

        self.key.lock().iter_mut().for_each(|b| *b = 0);

        let scripts: Vec<PathBuf> = std::mem::take(&mut *self.scripts.lock());
        for path in scripts {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove askpass script");
                }
            }
        }
    }

    /// Whether the handler has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for SecurePasswordHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SecurePasswordHandler {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// POSIX single-quote escaping: `'` becomes `'\''`. Applied exactly once
/// per embedded password.
pub fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', "'\\''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_retrieve_round_trip() {
        let handler = SecurePasswordHandler::new();
        handler.store_password("db", "s3cret!").unwrap();
        assert_eq!(handler.retrieve_password("db").unwrap(), "s3cret!");
    }

    #[test]
    fn test_missing_id() {
        let handler = SecurePasswordHandler::new();
        assert!(handler.retrieve_password("nope").is_err());
    }

    #[test]
    fn test_ciphertext_differs_between_instances() {
        // Same plaintext, two handlers: the stored blobs must differ and
        // neither may contain the plaintext.
        let a = SecurePasswordHandler::new();
        let b = SecurePasswordHandler::new();
        a.store_password("x", "hunter2").unwrap();
        b.store_password("x", "hunter2").unwrap();

        let blob_a = a.secrets.lock().get("x").unwrap().clone();
        let blob_b = b.secrets.lock().get("x").unwrap().clone();
        assert_ne!(blob_a, blob_b);
        assert!(!blob_a
            .windows(7)
            .any(|w| w == b"hunter2"));
    }

    #[test]
    fn test_askpass_script_contents_and_mode() {
        let handler = SecurePasswordHandler::new();
        let path = handler.create_askpass_script("pw!with'quote").unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("#!/bin/sh\n"));
        assert!(body.contains("echo 'pw!with'\\''quote'"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        handler.cleanup_script(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_dispose_removes_scripts_and_blocks_reuse() {
        let handler = SecurePasswordHandler::new();
        handler.store_password("a", "p").unwrap();
        let path = handler.create_askpass_script("p").unwrap();

        handler.dispose();
        assert!(!path.exists());
        assert!(handler.store_password("b", "q").is_err());
        assert!(handler.retrieve_password("a").is_err());
        assert!(handler.create_askpass_script("q").is_err());

        // Idempotent.
        handler.dispose();
    }

    #[test]
    fn test_mask_password() {
        let masked =
            SecurePasswordHandler::mask_password("sudo -S echo 'pw!' | cmd", "pw!");
        assert!(!masked.contains("pw!"));
        assert!(masked.contains(MASK));
        assert_eq!(SecurePasswordHandler::mask_password("text", ""), "text");
    }

    #[test]
    fn test_escape_single_quotes() {
        assert_eq!(escape_single_quotes("abc"), "abc");
        assert_eq!(escape_single_quotes("a'b"), "a'\\''b");
    }
}

//! Master key that protects the local private key at rest.
//!
//! The usual master key is the operator's gpg key. Operators without one
//! fall back to an age passphrase.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

use chillbox_core::{ChillboxError, ChillboxResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::prompt::Prompter;

pub trait MasterKey {
    fn seal(&self, plaintext: &[u8]) -> ChillboxResult<Vec<u8>>;

    /// Failures here are [`ChillboxError::KeyUnlock`].
    fn unseal(&self, ciphertext: &[u8]) -> ChillboxResult<Zeroizing<Vec<u8>>>;
}

// ── gpg ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GpgMasterKey {
    recipient: String,
}

impl GpgMasterKey {
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
        }
    }
}

/// Run gpg with `input` on stdin and return stdout, or the stderr
/// diagnostics on failure.
fn run_gpg(args: &[&str], input: &[u8]) -> ChillboxResult<Result<Vec<u8>, String>> {
    let mut child = Command::new("gpg")
        .args(["--batch", "--quiet", "--yes"])
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ChillboxError::Dependency("the gpg command was not found on PATH".into())
            }
            _ => ChillboxError::Gpg(format!("spawning gpg: {e}")),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input)?;
    }

    let output = child.wait_with_output()?;
    if output.status.success() {
        Ok(Ok(output.stdout))
    } else {
        Ok(Err(format!(
            "gpg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl MasterKey for GpgMasterKey {
    fn seal(&self, plaintext: &[u8]) -> ChillboxResult<Vec<u8>> {
        run_gpg(
            &["--encrypt", "--recipient", &self.recipient, "--output", "-"],
            plaintext,
        )?
        .map_err(ChillboxError::Encryption)
    }

    fn unseal(&self, ciphertext: &[u8]) -> ChillboxResult<Zeroizing<Vec<u8>>> {
        // --batch would disable pinentry for protected keys
        let mut child = Command::new("gpg")
            .args(["--quiet", "--yes", "--decrypt", "--output", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ChillboxError::KeyUnlock(format!("spawning gpg: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(ciphertext)?;
        }

        let mut plaintext = Zeroizing::new(Vec::new());
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_end(&mut plaintext)?;
        }
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            err.read_to_string(&mut stderr)?;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(ChillboxError::KeyUnlock(format!(
                "gpg exited with {status}: {}",
                stderr.trim()
            )));
        }
        Ok(plaintext)
    }
}

/// Make sure a gpg secret key named `name` exists, creating one when absent.
///
/// Key creation is interactive (pinentry asks for the passphrase).
pub fn ensure_gpg_key(name: &str) -> ChillboxResult<bool> {
    let listed = Command::new("gpg")
        .args(["--list-secret-keys", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ChillboxError::Dependency("the gpg command was not found on PATH".into())
            }
            _ => ChillboxError::Gpg(format!("listing gpg keys: {e}")),
        })?;
    if listed.success() {
        tracing::debug!(gpg_key = %name, "gpg key exists");
        return Ok(false);
    }

    tracing::info!(gpg_key = %name, "creating new gpg key");
    let status = Command::new("gpg")
        .args(["--quick-generate-key", name, "default", "encrypt", "never"])
        .status()
        .map_err(|e| ChillboxError::Gpg(format!("spawning gpg: {e}")))?;
    if !status.success() {
        return Err(ChillboxError::Gpg(format!(
            "failed to create the gpg key '{name}' (exit {status})"
        )));
    }
    Ok(true)
}

// ── passphrase ──────────────────────────────────────────────────────────────

/// age scrypt passphrase used when no gpg key is configured.
pub struct PassphraseMasterKey {
    passphrase: SecretString,
}

impl std::fmt::Debug for PassphraseMasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseMasterKey")
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

impl PassphraseMasterKey {
    pub fn new(passphrase: SecretString) -> Self {
        Self { passphrase }
    }

    /// Ask for the passphrase. A new key asks twice and requires a match.
    pub fn prompt(prompter: &dyn Prompter, new_key: bool) -> ChillboxResult<Self> {
        let passphrase = prompter.secret("Master key passphrase:")?;
        if passphrase.expose_secret().is_empty() {
            return Err(ChillboxError::KeyUnlock("empty passphrase".into()));
        }
        if new_key {
            let again = prompter.secret("Repeat the master key passphrase:")?;
            if again.expose_secret() != passphrase.expose_secret() {
                return Err(ChillboxError::KeyUnlock("passphrases do not match".into()));
            }
        }
        Ok(Self { passphrase })
    }
}

impl MasterKey for PassphraseMasterKey {
    fn seal(&self, plaintext: &[u8]) -> ChillboxResult<Vec<u8>> {
        let encryptor = age::Encryptor::with_user_passphrase(self.passphrase.clone());
        let mut ciphertext = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut ciphertext)
            .map_err(|e| ChillboxError::Encryption(e.to_string()))?;
        writer
            .write_all(plaintext)
            .map_err(|e| ChillboxError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| ChillboxError::Encryption(e.to_string()))?;
        Ok(ciphertext)
    }

    fn unseal(&self, ciphertext: &[u8]) -> ChillboxResult<Zeroizing<Vec<u8>>> {
        let decryptor = age::Decryptor::new(ciphertext)
            .map_err(|e| ChillboxError::KeyUnlock(e.to_string()))?;
        let identity = age::scrypt::Identity::new(self.passphrase.clone());
        let mut reader = decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .map_err(|e| ChillboxError::KeyUnlock(e.to_string()))?;
        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| ChillboxError::KeyUnlock(e.to_string()))?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_round_trip() {
        let key = PassphraseMasterKey::new(SecretString::from("correct horse".to_string()));
        let sealed = key.seal(b"AGE-SECRET-KEY-1XYZ").unwrap();
        assert_eq!(key.unseal(&sealed).unwrap().as_slice(), b"AGE-SECRET-KEY-1XYZ");
    }

    #[test]
    fn wrong_passphrase_is_key_unlock_error() {
        let key = PassphraseMasterKey::new(SecretString::from("correct horse".to_string()));
        let sealed = key.seal(b"data").unwrap();
        let other = PassphraseMasterKey::new(SecretString::from("battery staple".to_string()));
        assert!(matches!(
            other.unseal(&sealed),
            Err(ChillboxError::KeyUnlock(_))
        ));
    }

    #[test]
    fn debug_redacts_passphrase() {
        let key = PassphraseMasterKey::new(SecretString::from("hunter2".to_string()));
        assert!(!format!("{key:?}").contains("hunter2"));
    }
}

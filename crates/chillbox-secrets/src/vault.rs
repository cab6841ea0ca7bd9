//! Encrypted-at-rest secrets for the current operator.
//!
//! Each configured secret is evaluated against the archive before anything
//! is prompted:
//!
//! | owner        | ciphertext | expires       | decision            |
//! |--------------|------------|---------------|---------------------|
//! | someone else | any        | any           | skip                |
//! | me           | absent     | any           | prompt and store    |
//! | me           | present    | none          | skip                |
//! | me           | present    | after today   | skip                |
//! | me           | present    | today/earlier | fatal, never reprompt |

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use chillbox_core::config::Secret;
use chillbox_core::{ArchiveLayout, ChillboxError, ChillboxResult, Decision, Identity, SkipReason};
use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};

use crate::keys::UnlockedKey;
use crate::prompt::Prompter;
use crate::shred::ShredGuard;
use crate::tool::{encrypt_to, CryptoTool};

/// Decide what to do with one secret. Pure; touches no files.
pub fn evaluate_secret(
    secret: &Secret,
    identity: &Identity,
    ciphertext_exists: bool,
    today: NaiveDate,
) -> Decision {
    if !identity.owns(secret.owner.as_deref()) {
        return Decision::Skip(SkipReason::NotOwner {
            owner: secret.owner.clone(),
        });
    }
    if !ciphertext_exists {
        return Decision::Process;
    }
    match secret.expires {
        None => Decision::Skip(SkipReason::NoExpiration),
        Some(expires) if today < expires => Decision::Skip(SkipReason::NotExpired { expires }),
        Some(expires) => Decision::Fatal(ChillboxError::ExpiredSecret {
            id: secret.id.clone(),
            expires,
        }),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub stored: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
}

pub struct SecretsVault<'a> {
    layout: &'a ArchiveLayout,
    crypto: &'a dyn CryptoTool,
    identity: &'a Identity,
}

impl<'a> SecretsVault<'a> {
    pub fn new(layout: &'a ArchiveLayout, crypto: &'a dyn CryptoTool, identity: &'a Identity) -> Self {
        Self {
            layout,
            crypto,
            identity,
        }
    }

    /// Prompt for and store every owned secret that has no ciphertext yet.
    ///
    /// Every secret is evaluated first, so an expired secret fails the run
    /// before the operator is asked for anything.
    pub fn sync_secrets(
        &self,
        secrets: &[Secret],
        prompter: &dyn Prompter,
        today: NaiveDate,
    ) -> ChillboxResult<SyncReport> {
        let mut plan = Vec::with_capacity(secrets.len());
        for secret in secrets {
            let exists = self.layout.secret(&secret.id).exists();
            match evaluate_secret(secret, self.identity, exists, today) {
                Decision::Fatal(e) => return Err(e),
                decision => plan.push((secret, decision)),
            }
        }

        let mut report = SyncReport::default();
        for (secret, decision) in plan {
            match decision {
                Decision::Skip(reason) => {
                    tracing::info!(secret = %secret.id, "skipping secret: {reason}");
                    report.skipped.push((secret.id.clone(), reason));
                }
                Decision::Process => {
                    let value = prompter.secret(&secret.prompt)?;
                    self.store(secret, &value)?;
                    report.stored.push(secret.id.clone());
                }
                Decision::Fatal(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Encrypt `value` to the local public key as `secrets/{id}.aes`.
    fn store(&self, secret: &Secret, value: &SecretString) -> ChillboxResult<()> {
        let cleartext = ShredGuard::temp("chillbox-secret-")?;
        std::fs::write(cleartext.path(), value.expose_secret().as_bytes())?;
        let ciphertext = encrypt_to(self.crypto, &self.layout.public_key(), cleartext.path())?;
        cleartext.shred()?;

        let dest = self.layout.secret(&secret.id);
        std::fs::create_dir_all(self.layout.secrets_dir())?;
        let tmp = dest.with_extension("aes.tmp");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&ciphertext)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &dest)?;

        tracing::info!(secret = %secret.id, "stored secret");
        Ok(())
    }

    /// Decrypt one owned secret for immediate use.
    pub fn decrypt_for_use(&self, secret: &Secret, key: &UnlockedKey) -> ChillboxResult<SecretString> {
        if !self.identity.owns(secret.owner.as_deref()) {
            return Err(ChillboxError::Decryption(format!(
                "the secret '{}' is not owned by {}",
                secret.id, self.identity
            )));
        }
        let path = self.layout.secret(&secret.id);
        let ciphertext = std::fs::read(&path).map_err(|e| {
            ChillboxError::MissingFile(format!("secret '{}' at {}: {e}", secret.id, path.display()))
        })?;
        let plaintext = self.crypto.decrypt(&key.private_key()?, &ciphertext)?;
        let text = String::from_utf8(plaintext.to_vec()).map_err(|_| {
            ChillboxError::Decryption(format!("the secret '{}' is not valid UTF-8", secret.id))
        })?;
        Ok(SecretString::from(text))
    }

    /// Decrypt every owned secret, keyed by its variable name.
    pub fn load_secrets(
        &self,
        secrets: &[Secret],
        key: &UnlockedKey,
    ) -> ChillboxResult<BTreeMap<String, SecretString>> {
        let mut loaded = BTreeMap::new();
        for secret in secrets {
            if !self.identity.owns(secret.owner.as_deref()) {
                tracing::debug!(secret = %secret.id, "not loading secret owned by someone else");
                continue;
            }
            loaded.insert(secret.name.clone(), self.decrypt_for_use(secret, key)?);
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(owner: Option<&str>, expires: Option<NaiveDate>) -> Secret {
        Secret {
            id: "db-pass".into(),
            name: "DB_PASSWORD".into(),
            owner: owner.map(String::from),
            prompt: "Database password".into(),
            expires,
            dest: None,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn not_owned_is_skipped_even_when_expired() {
        let s = secret(Some("alice"), Some(day(2020, 1, 1)));
        let decision = evaluate_secret(&s, &Identity::new("bob"), true, day(2024, 1, 1));
        assert!(matches!(decision, Decision::Skip(SkipReason::NotOwner { .. })));
    }

    #[test]
    fn unowned_secret_is_skipped() {
        let s = secret(None, None);
        let decision = evaluate_secret(&s, &Identity::new("alice"), false, day(2024, 1, 1));
        assert!(matches!(decision, Decision::Skip(SkipReason::NotOwner { owner: None })));
    }

    #[test]
    fn missing_ciphertext_is_processed() {
        let s = secret(Some("alice"), Some(day(2020, 1, 1)));
        assert!(evaluate_secret(&s, &Identity::new("alice"), false, day(2024, 1, 1)).is_process());
    }

    #[test]
    fn existing_without_expiry_is_skipped() {
        let s = secret(Some("alice"), None);
        let decision = evaluate_secret(&s, &Identity::new("alice"), true, day(2024, 1, 1));
        assert!(matches!(decision, Decision::Skip(SkipReason::NoExpiration)));
    }

    #[test]
    fn future_expiry_is_skipped() {
        let s = secret(Some("alice"), Some(day(2030, 1, 1)));
        let decision = evaluate_secret(&s, &Identity::new("alice"), true, day(2024, 1, 1));
        assert!(matches!(decision, Decision::Skip(SkipReason::NotExpired { .. })));
    }

    #[test]
    fn expired_is_fatal() {
        let s = secret(Some("alice"), Some(day(2020, 1, 1)));
        let decision = evaluate_secret(&s, &Identity::new("alice"), true, day(2024, 1, 1));
        assert!(matches!(
            decision,
            Decision::Fatal(ChillboxError::ExpiredSecret { ref id, .. }) if id == "db-pass"
        ));
    }

    #[test]
    fn expiring_today_is_fatal() {
        let s = secret(Some("alice"), Some(day(2024, 1, 1)));
        let decision = evaluate_secret(&s, &Identity::new("alice"), true, day(2024, 1, 1));
        assert!(matches!(decision, Decision::Fatal(_)));
    }
}

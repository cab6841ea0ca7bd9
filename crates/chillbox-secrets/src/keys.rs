//! Instance keypair custody.
//!
//! The private half lives in the archive only as master-key ciphertext. When
//! a task needs it, it is unsealed into a process-private temp file whose
//! path is recorded in the state file *before* any plaintext is written, so a
//! crashed run leaves a record the next run can act on.

use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chillbox_core::{ArchiveLayout, ChillboxError, ChillboxResult};
use secrecy::{ExposeSecret, SecretString};

use crate::master::MasterKey;
use crate::shred::{private_temp_file, shred_file};
use crate::tool::{read_private_key, CryptoTool};

/// State key holding the path of the unlocked private key.
pub const LOCAL_PRIVATE_KEY_TEMP: &str = "local_private_key_temp";

/// Somewhere to record temp file paths across invocations.
pub trait TempRecords {
    fn record_temp(&mut self, key: &str, path: &Path) -> ChillboxResult<()>;
    fn clear_temp(&mut self, key: &str) -> ChillboxResult<()>;
}

/// Handle to the unsealed private key file.
///
/// Dropping the handle shreds the file. [`UnlockedKey::release`] also clears
/// the state record.
#[derive(Debug)]
pub struct UnlockedKey {
    path: Option<PathBuf>,
}

impl UnlockedKey {
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    pub fn private_key(&self) -> ChillboxResult<SecretString> {
        read_private_key(self.path())
    }

    pub fn release(mut self, records: &mut dyn TempRecords) -> ChillboxResult<()> {
        if let Some(path) = self.path.take() {
            shred_file(&path)?;
            tracing::debug!(path = %path.display(), "released unlocked private key");
        }
        records.clear_temp(LOCAL_PRIVATE_KEY_TEMP)
    }
}

impl Drop for UnlockedKey {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = shred_file(&path) {
                tracing::warn!(path = %path.display(), "failed to shred unlocked key: {e}");
            }
        }
    }
}

pub struct KeyManager<'a> {
    layout: &'a ArchiveLayout,
    crypto: &'a dyn CryptoTool,
    master: &'a dyn MasterKey,
}

impl<'a> KeyManager<'a> {
    pub fn new(
        layout: &'a ArchiveLayout,
        crypto: &'a dyn CryptoTool,
        master: &'a dyn MasterKey,
    ) -> Self {
        Self {
            layout,
            crypto,
            master,
        }
    }

    /// Create the instance keypair unless the sealed private key already
    /// exists. Returns `true` when a new pair was created.
    ///
    /// The public half is written first. A sealed private key is only ever
    /// present alongside its public key.
    pub fn ensure_key_pair(&self) -> ChillboxResult<bool> {
        let private_path = self.layout.private_key();
        let public_path = self.layout.public_key();
        if private_path.exists() {
            if !public_path.exists() {
                return Err(ChillboxError::MissingFile(format!(
                    "{} is missing but the sealed private key exists; remove {} to create a new keypair",
                    public_path.display(),
                    private_path.display()
                )));
            }
            tracing::debug!(path = %private_path.display(), "local keypair exists");
            return Ok(false);
        }

        let dir = self.layout.asymmetric_dir();
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)?;

        let (private, public) = self.crypto.generate_keypair()?;
        let sealed = self.master.seal(private.expose_secret().as_bytes())?;
        drop(private);

        // a public key without a private key is left over from an interrupted run
        if public_path.exists() {
            std::fs::remove_file(&public_path)?;
        }
        std::fs::write(&public_path, format!("{public}\n"))?;
        std::fs::set_permissions(&public_path, std::fs::Permissions::from_mode(0o400))?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&private_path)?;
        file.write_all(&sealed)?;
        file.sync_all()?;

        tracing::info!(instance = %self.layout.instance(), "created local keypair");
        Ok(true)
    }

    /// Unseal the private key into a fresh temp file recorded in `records`.
    pub fn unlock_private_key(&self, records: &mut dyn TempRecords) -> ChillboxResult<UnlockedKey> {
        let sealed_path = self.layout.private_key();
        let sealed = std::fs::read(&sealed_path).map_err(|e| {
            ChillboxError::MissingFile(format!("{}: {e}", sealed_path.display()))
        })?;

        let temp = private_temp_file("chillbox-key-")?;
        let key = UnlockedKey {
            path: Some(temp.clone()),
        };
        records.record_temp(LOCAL_PRIVATE_KEY_TEMP, &temp)?;

        let result = self.master.unseal(&sealed).and_then(|plaintext| {
            let mut file = std::fs::OpenOptions::new().write(true).open(&temp)?;
            file.write_all(&plaintext)?;
            file.sync_all()?;
            Ok(())
        });
        match result {
            Ok(()) => {
                tracing::info!("unlocked the local private key");
                Ok(key)
            }
            Err(e) => {
                key.release(records)?;
                Err(match e {
                    e @ ChillboxError::KeyUnlock(_) => e,
                    other => ChillboxError::KeyUnlock(other.to_string()),
                })
            }
        }
    }
}

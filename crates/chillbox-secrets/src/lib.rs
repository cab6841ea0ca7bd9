//! chillbox-secrets: local keypair custody and the secrets vault
//!
//! The instance keypair is sealed by a master key (gpg, or an age passphrase
//! when no gpg key is configured). Everything staged in the archive is
//! encrypted to the instance public key with [`CryptoTool`].

pub mod keys;
pub mod master;
pub mod prompt;
pub mod shred;
pub mod tool;
pub mod vault;

pub use keys::{KeyManager, TempRecords, UnlockedKey, LOCAL_PRIVATE_KEY_TEMP};
pub use master::{ensure_gpg_key, GpgMasterKey, MasterKey, PassphraseMasterKey};
pub use prompt::{Prompter, TerminalPrompter};
pub use shred::{private_temp_file, shred_file, ShredGuard};
pub use tool::{decrypt_with, encrypt_to, AgeTool, CryptoTool};
pub use vault::{evaluate_secret, SecretsVault, SyncReport};

//! Asymmetric encryption capability (age 0.11 X25519).
//!
//! Public keys are `age1…` recipient strings and private keys are
//! `AGE-SECRET-KEY-1…` identity strings. Both are stored as text so the
//! archive's `.public.pem` file can be copied to and from servers as-is.

use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use chillbox_core::{ChillboxError, ChillboxResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

/// Encrypt/decrypt bytes with an instance or server keypair.
pub trait CryptoTool {
    /// New keypair as `(private, public)` text.
    fn generate_keypair(&self) -> ChillboxResult<(SecretString, String)>;

    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> ChillboxResult<Vec<u8>>;

    fn decrypt(
        &self,
        private_key: &SecretString,
        ciphertext: &[u8],
    ) -> ChillboxResult<Zeroizing<Vec<u8>>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AgeTool;

impl CryptoTool for AgeTool {
    fn generate_keypair(&self) -> ChillboxResult<(SecretString, String)> {
        let identity = age::x25519::Identity::generate();
        let public = identity.to_public().to_string();
        Ok((identity.to_string(), public))
    }

    fn encrypt(&self, public_key: &str, plaintext: &[u8]) -> ChillboxResult<Vec<u8>> {
        let recipient = age::x25519::Recipient::from_str(public_key.trim())
            .map_err(|e| ChillboxError::Encryption(format!("invalid public key: {e}")))?;

        let encryptor =
            age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))
                .map_err(|e| ChillboxError::Encryption(e.to_string()))?;

        let mut ciphertext = Vec::with_capacity(plaintext.len() + 256);
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

    fn decrypt(
        &self,
        private_key: &SecretString,
        ciphertext: &[u8],
    ) -> ChillboxResult<Zeroizing<Vec<u8>>> {
        let identity = age::x25519::Identity::from_str(private_key.expose_secret().trim())
            .map_err(|e| ChillboxError::Decryption(format!("invalid private key: {e}")))?;

        let decryptor = age::Decryptor::new(ciphertext)
            .map_err(|e| ChillboxError::Decryption(e.to_string()))?;
        if decryptor.is_scrypt() {
            return Err(ChillboxError::Decryption(
                "ciphertext is passphrase-protected, not encrypted to a key".into(),
            ));
        }

        let mut reader = decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .map_err(|e| ChillboxError::Decryption(e.to_string()))?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| ChillboxError::Decryption(e.to_string()))?;
        Ok(plaintext)
    }
}

/// Encrypt the file at `plaintext_path` to the public key stored at
/// `public_key_path`.
pub fn encrypt_to(
    crypto: &dyn CryptoTool,
    public_key_path: &Path,
    plaintext_path: &Path,
) -> ChillboxResult<Vec<u8>> {
    let public_key = read_key_file(public_key_path)?;
    let plaintext = Zeroizing::new(std::fs::read(plaintext_path)?);
    crypto.encrypt(&public_key, &plaintext)
}

/// Decrypt the file at `ciphertext_path` with the private key stored at
/// `private_key_path`.
pub fn decrypt_with(
    crypto: &dyn CryptoTool,
    private_key_path: &Path,
    ciphertext_path: &Path,
) -> ChillboxResult<Zeroizing<Vec<u8>>> {
    let private_key = read_private_key(private_key_path)?;
    let ciphertext = std::fs::read(ciphertext_path).map_err(|e| {
        ChillboxError::MissingFile(format!("{}: {e}", ciphertext_path.display()))
    })?;
    crypto.decrypt(&private_key, &ciphertext)
}

/// Read a public key file, trimmed.
pub fn read_key_file(path: &Path) -> ChillboxResult<String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ChillboxError::MissingFile(format!("{}: {e}", path.display())))?;
    Ok(text.trim().to_string())
}

/// Read a private key file into a secret string.
pub fn read_private_key(path: &Path) -> ChillboxResult<SecretString> {
    let text = Zeroizing::new(
        std::fs::read_to_string(path)
            .map_err(|e| ChillboxError::MissingFile(format!("{}: {e}", path.display())))?,
    );
    Ok(SecretString::from(text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_round_trip() {
        let tool = AgeTool;
        let (private, public) = tool.generate_keypair().unwrap();
        assert!(public.starts_with("age1"));

        let ciphertext = tool.encrypt(&public, b"port=8080").unwrap();
        assert_ne!(ciphertext.as_slice(), b"port=8080");
        let plaintext = tool.decrypt(&private, &ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), b"port=8080");
    }

    #[test]
    fn wrong_key_is_a_decryption_error() {
        let tool = AgeTool;
        let (_, public) = tool.generate_keypair().unwrap();
        let (other_private, _) = tool.generate_keypair().unwrap();
        let ciphertext = tool.encrypt(&public, b"secret").unwrap();
        assert!(matches!(
            tool.decrypt(&other_private, &ciphertext),
            Err(ChillboxError::Decryption(_))
        ));
    }

    #[test]
    fn invalid_public_key_is_an_encryption_error() {
        assert!(matches!(
            AgeTool.encrypt("not-a-key", b"x"),
            Err(ChillboxError::Encryption(_))
        ));
    }

    #[test]
    fn path_wrappers() {
        let dir = tempfile::tempdir().unwrap();
        let (private, public) = AgeTool.generate_keypair().unwrap();
        std::fs::write(dir.path().join("key.public.pem"), format!("{public}\n")).unwrap();
        std::fs::write(dir.path().join("key.private"), private.expose_secret()).unwrap();
        std::fs::write(dir.path().join("plain"), b"hello").unwrap();

        let ciphertext =
            encrypt_to(&AgeTool, &dir.path().join("key.public.pem"), &dir.path().join("plain"))
                .unwrap();
        std::fs::write(dir.path().join("cipher"), &ciphertext).unwrap();
        let plaintext =
            decrypt_with(&AgeTool, &dir.path().join("key.private"), &dir.path().join("cipher"))
                .unwrap();
        assert_eq!(plaintext.as_slice(), b"hello");
    }
}

use std::path::{Path, PathBuf};

use chillbox_core::config::ChillboxConfig;
use chillbox_core::{ArchiveLayout, ChillboxError, ChillboxResult, Identity};
use chillbox_secrets::{CryptoTool, UnlockedKey};

use crate::compress::{extract_tar_gz, gunzip_to};
use crate::umask::UmaskGuard;

/// Decrypt one archived path into a fresh temp directory and return it.
///
/// Files land at `{tmp}/{basename(dest)}`; directories are extracted into
/// the same location with their top component stripped.
pub fn show_path(
    layout: &ArchiveLayout,
    config: &ChillboxConfig,
    crypto: &dyn CryptoTool,
    key: &UnlockedKey,
    identity: &Identity,
    path_id: &str,
    allow_sensitive: bool,
) -> ChillboxResult<PathBuf> {
    let entry = config.path(path_id).ok_or_else(|| {
        ChillboxError::archive(format!("no path with id '{path_id}' in the configuration"))
    })?;

    if !identity.may_access(entry.owner.as_deref()) {
        return Err(ChillboxError::ShowFile(format!(
            "the path '{path_id}' is owned by {}, not {identity}",
            entry.owner.as_deref().unwrap_or_default()
        )));
    }
    if entry.sensitive && !allow_sensitive {
        return Err(ChillboxError::ShowFile(format!(
            "the path '{path_id}' is sensitive; pass --sensitive to show it"
        )));
    }

    let archived = layout.path(path_id);
    let ciphertext = std::fs::read(&archived).map_err(|e| {
        ChillboxError::MissingFile(format!("{}: {e}", archived.display()))
    })?;
    let payload = crypto.decrypt(&key.private_key()?, &ciphertext)?;

    let _umask = UmaskGuard::owner_only();
    let tmp = tempfile::Builder::new()
        .prefix("chillbox-show-")
        .tempdir()?
        .keep();
    let name = Path::new(&entry.dest)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| path_id.into());
    let target = tmp.join(name);

    if entry.src.is_directory() {
        extract_tar_gz(&payload, &target)?;
    } else {
        gunzip_to(&payload, &target)?;
    }
    tracing::info!(path_id = %path_id, dir = %tmp.display(), "decrypted path");
    Ok(tmp)
}

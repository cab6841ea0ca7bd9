//! The operator's chillbox ssh identity.
//!
//! The private key is stored in the archive encrypted to the local instance
//! key (`ssh/{user}.chillbox.pem.aes`). `ssh-unlock` decrypts it next to a
//! generated `ssh_config`; `ssh-lock` shreds both.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chillbox_archive::state::{ArchiveState, IDENTITY_FILE_TEMP, SSH_CONFIG_TEMP};
use chillbox_core::config::ChillboxConfig;
use chillbox_core::{ArchiveLayout, ChillboxError, ChillboxResult, Identity};
use chillbox_secrets::tool::read_key_file;
use chillbox_secrets::{shred_file, CryptoTool, ShredGuard, TempRecords, UnlockedKey};
use tokio::process::Command;
use zeroize::Zeroizing;

/// Generate and store the operator's ssh key unless it already exists.
/// Returns `true` when a new key was created.
pub async fn ensure_user_ssh_key(
    layout: &ArchiveLayout,
    state: &mut ArchiveState,
    crypto: &dyn CryptoTool,
    identity: &Identity,
) -> ChillboxResult<bool> {
    let stored = layout.user_ssh_key(&identity.name);
    if stored.exists() {
        return Ok(false);
    }

    let dir = tempfile::Builder::new()
        .prefix("chillbox-ssh-keygen-")
        .tempdir()?;
    let key_path = dir.path().join("id_ed25519");
    let private = ShredGuard::new(&key_path);

    let comment = format!("{}@{}", identity.name, layout.instance());
    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", &comment, "-f"])
        .arg(&key_path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ChillboxError::Dependency("the ssh-keygen command was not found on PATH".into())
            }
            _ => ChillboxError::Other(anyhow::anyhow!("spawning ssh-keygen: {e}")),
        })?;
    if !output.status.success() {
        return Err(ChillboxError::Other(anyhow::anyhow!(
            "ssh-keygen failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let plaintext = Zeroizing::new(std::fs::read(private.path())?);
    let public_key = read_key_file(&layout.public_key())?;
    let ciphertext = crypto.encrypt(&public_key, &plaintext)?;
    private.shred()?;

    std::fs::create_dir_all(layout.ssh_dir())?;
    std::fs::write(&stored, ciphertext)?;

    let public_ssh_key = std::fs::read_to_string(key_path.with_extension("pub"))?;
    let mut data = state.current_user_data()?;
    let public_ssh_key = public_ssh_key.trim().to_string();
    if !data.public_ssh_key.contains(&public_ssh_key) {
        data.public_ssh_key.push(public_ssh_key);
    }
    state.set_current_user_data(&data)?;

    tracing::info!(user = %identity, "created chillbox ssh key");
    Ok(true)
}

/// `ssh_config` text for every server `identity` logs into.
pub fn render_ssh_config(
    config: &ChillboxConfig,
    layout: &ArchiveLayout,
    identity: &Identity,
    identity_file: &Path,
) -> String {
    let mut text = String::new();
    for server in config
        .servers
        .iter()
        .filter(|s| s.login_users.iter().any(|u| *u == identity.name))
    {
        let _ = writeln!(text, "Host {}", server.name);
        let _ = writeln!(text, "  HostName {}", server.host);
        let _ = writeln!(text, "  User {}", identity.name);
        let _ = writeln!(text, "  IdentityFile {}", identity_file.display());
        let _ = writeln!(text, "  IdentitiesOnly yes");
        let _ = writeln!(text, "  UserKnownHostsFile {}", layout.known_hosts().display());
        text.push('\n');
    }
    text
}

/// Decrypt the ssh identity and write a matching `ssh_config`, replacing any
/// earlier unlock. Returns the `ssh_config` path.
pub fn ssh_unlock(
    layout: &ArchiveLayout,
    state: &mut ArchiveState,
    config: &ChillboxConfig,
    crypto: &dyn CryptoTool,
    key: &UnlockedKey,
    identity: &Identity,
) -> ChillboxResult<PathBuf> {
    ssh_lock(state)?;

    let stored = layout.user_ssh_key(&identity.name);
    let ciphertext = std::fs::read(&stored)
        .map_err(|e| ChillboxError::MissingFile(format!("{}: {e}", stored.display())))?;

    let identity_file = ShredGuard::temp("chillbox-identity-")?;
    state.record_temp(IDENTITY_FILE_TEMP, identity_file.path())?;
    let written = write_unlocked(
        layout,
        state,
        config,
        crypto,
        key,
        identity,
        &ciphertext,
        identity_file.path(),
    );
    let ssh_config = match written {
        Ok(ssh_config) => ssh_config,
        Err(e) => {
            identity_file.shred()?;
            state.clear_temp(SSH_CONFIG_TEMP)?;
            state.clear_temp(IDENTITY_FILE_TEMP)?;
            return Err(e);
        }
    };

    identity_file.into_path();
    tracing::info!(
        "use the ssh command: ssh -F {} SERVER_NAME",
        ssh_config.display()
    );
    Ok(ssh_config)
}

#[allow(clippy::too_many_arguments)]
fn write_unlocked(
    layout: &ArchiveLayout,
    state: &mut ArchiveState,
    config: &ChillboxConfig,
    crypto: &dyn CryptoTool,
    key: &UnlockedKey,
    identity: &Identity,
    ciphertext: &[u8],
    identity_file: &Path,
) -> ChillboxResult<PathBuf> {
    let plaintext = crypto.decrypt(&key.private_key()?, ciphertext)?;
    std::fs::write(identity_file, plaintext.as_slice())?;

    let ssh_config = tempfile::Builder::new()
        .prefix("chillbox-")
        .suffix(".chillbox.ssh_config")
        .tempfile()?;
    let (_, ssh_config) = ssh_config.keep().map_err(|e| e.error)?;
    let ssh_config = ShredGuard::new(ssh_config);
    state.record_temp(SSH_CONFIG_TEMP, ssh_config.path())?;
    std::fs::write(
        ssh_config.path(),
        render_ssh_config(config, layout, identity, identity_file),
    )?;
    Ok(ssh_config.into_path())
}

/// Shred the unlocked ssh identity and config, clearing their records.
pub fn ssh_lock(state: &mut ArchiveState) -> ChillboxResult<()> {
    for key in [SSH_CONFIG_TEMP, IDENTITY_FILE_TEMP] {
        if let Some(path) = state.temp_path(key)? {
            shred_file(&path)?;
            tracing::debug!(key, path = %path.display(), "shredded");
        }
        state.clear_temp(key)?;
    }
    Ok(())
}

use std::fmt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::error::{ChillboxError, ChillboxResult};

// ── Archive layout ──────────────────────────────────────────────────────────

/// File layout of one instance's archive directory.
///
/// Other tooling reads these paths directly, so they must not drift:
///
/// ```text
/// statefile.json
/// local-chillbox-asymmetric/{instance}.private.pem.gpg
/// local-chillbox-asymmetric/{instance}.public.pem
/// secrets/{id}.aes
/// path/{id}
/// server/{name}/user-data
/// server/{name}/public_ssh_key
/// ssh/{user}.chillbox.pem.aes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    root: PathBuf,
    instance: String,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            instance: instance.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("statefile.json")
    }

    pub fn asymmetric_dir(&self) -> PathBuf {
        self.root.join("local-chillbox-asymmetric")
    }

    pub fn private_key(&self) -> PathBuf {
        self.asymmetric_dir()
            .join(format!("{}.private.pem.gpg", self.instance))
    }

    pub fn public_key(&self) -> PathBuf {
        self.asymmetric_dir()
            .join(format!("{}.public.pem", self.instance))
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    pub fn secret(&self, id: &str) -> PathBuf {
        self.secrets_dir().join(format!("{id}.aes"))
    }

    pub fn paths_dir(&self) -> PathBuf {
        self.root.join("path")
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.paths_dir().join(id)
    }

    pub fn server_dir(&self, name: &str) -> PathBuf {
        self.root.join("server").join(name)
    }

    pub fn server_user_data(&self, name: &str) -> PathBuf {
        self.server_dir(name).join("user-data")
    }

    pub fn server_public_ssh_key(&self, name: &str) -> PathBuf {
        self.server_dir(name).join("public_ssh_key")
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.root.join("ssh")
    }

    pub fn user_ssh_key(&self, user: &str) -> PathBuf {
        self.ssh_dir().join(format!("{user}.chillbox.pem.aes"))
    }

    pub fn known_hosts(&self) -> PathBuf {
        self.root.join("ssh_known_hosts")
    }

    /// Create the archive directory (owner-only) or verify an existing one.
    ///
    /// An existing archive directory must be a directory owned by the
    /// invoking uid.
    pub fn init(&self) -> ChillboxResult<()> {
        if self.root.exists() && !self.root.is_dir() {
            return Err(ChillboxError::archive(format!(
                "the archive directory path ({}) exists but is not a directory",
                self.root.display()
            )));
        }
        if !self.root.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.root)?;
            tracing::info!(archive = %self.root.display(), "created archive directory");
        }

        let owner = std::fs::metadata(&self.root)?.uid();
        let me = nix::unistd::getuid().as_raw();
        if owner != me {
            return Err(ChillboxError::archive(format!(
                "the archive directory ({}) is owned by uid {owner}, not the current user (uid {me})",
                self.root.display()
            )));
        }
        Ok(())
    }
}

// ── Operator identity ───────────────────────────────────────────────────────

/// The operator whose ownership tags are honored for this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Login name of the invoking uid.
    pub fn current() -> ChillboxResult<Self> {
        let uid = nix::unistd::getuid();
        let user = nix::unistd::User::from_uid(uid)
            .map_err(|e| anyhow::anyhow!("failed to look up uid {uid}: {e}"))?
            .ok_or_else(|| anyhow::anyhow!("no passwd entry for uid {uid}"))?;
        Ok(Self { name: user.name })
    }

    /// An entry with no owner is visible to everyone.
    pub fn may_access(&self, owner: Option<&str>) -> bool {
        owner.map_or(true, |o| o == self.name)
    }

    /// Strict ownership: an entry with no owner belongs to nobody.
    pub fn owns(&self, owner: Option<&str>) -> bool {
        owner == Some(self.name.as_str())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ── Per-entry decisions ─────────────────────────────────────────────────────

/// Why an entry was left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotOwner { owner: Option<String> },
    /// Ciphertext exists and never expires.
    NoExpiration,
    /// Ciphertext exists and is still valid.
    NotExpired { expires: chrono::NaiveDate },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotOwner { owner: Some(o) } => write!(f, "owned by {o}"),
            SkipReason::NotOwner { owner: None } => f.write_str("has no owner"),
            SkipReason::NoExpiration => f.write_str("already stored, no expiration"),
            SkipReason::NotExpired { expires } => write!(f, "already stored, expires {expires}"),
        }
    }
}

/// Outcome of evaluating one secret or path entry before any crypto runs.
#[derive(Debug)]
pub enum Decision {
    Skip(SkipReason),
    Process,
    Fatal(ChillboxError),
}

impl Decision {
    pub fn is_process(&self) -> bool {
        matches!(self, Decision::Process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = ArchiveLayout::new("/a", "example");
        assert_eq!(layout.state_file(), PathBuf::from("/a/statefile.json"));
        assert_eq!(
            layout.private_key(),
            PathBuf::from("/a/local-chillbox-asymmetric/example.private.pem.gpg")
        );
        assert_eq!(
            layout.public_key(),
            PathBuf::from("/a/local-chillbox-asymmetric/example.public.pem")
        );
        assert_eq!(layout.secret("db-pass"), PathBuf::from("/a/secrets/db-pass.aes"));
        assert_eq!(layout.path("site-conf"), PathBuf::from("/a/path/site-conf"));
        assert_eq!(layout.server_user_data("web1"), PathBuf::from("/a/server/web1/user-data"));
        assert_eq!(
            layout.server_public_ssh_key("web1"),
            PathBuf::from("/a/server/web1/public_ssh_key")
        );
        assert_eq!(
            layout.user_ssh_key("alice"),
            PathBuf::from("/a/ssh/alice.chillbox.pem.aes")
        );
    }

    #[test]
    fn init_creates_owner_only_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = ArchiveLayout::new(dir.path().join("archive"), "example");
        layout.init().unwrap();
        let mode = std::fs::metadata(layout.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        // idempotent
        layout.init().unwrap();
    }

    #[test]
    fn init_rejects_a_plain_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let layout = ArchiveLayout::new(file.path(), "example");
        assert!(matches!(
            layout.init(),
            Err(ChillboxError::ArchiveDirectory { .. })
        ));
    }

    #[test]
    fn ownership_rules() {
        let alice = Identity::new("alice");
        assert!(alice.may_access(None));
        assert!(alice.may_access(Some("alice")));
        assert!(!alice.may_access(Some("bob")));
        assert!(alice.owns(Some("alice")));
        assert!(!alice.owns(None));
    }
}

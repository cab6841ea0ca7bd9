//! Remote command and file transfer capability.
//!
//! [`OpenSshSession`] multiplexes every command for one server over a single
//! OpenSSH control connection, so the operator authenticates once per server
//! per invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chillbox_core::{ChillboxError, ChillboxResult};
use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into a [`ChillboxError::Remote`].
    pub fn check(self, what: &str) -> ChillboxResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ChillboxError::Remote(format!(
                "{what} exited with {}: {}",
                self.exit_code,
                self.stderr.trim()
            )))
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait RemoteSession {
    async fn put(&mut self, local: &Path, remote: &str) -> ChillboxResult<()>;

    async fn get(&mut self, remote: &str, local: &Path) -> ChillboxResult<()>;

    async fn run(&mut self, command: &str) -> ChillboxResult<RemoteOutput>;

    async fn close(&mut self) -> ChillboxResult<()>;
}

pub struct OpenSshSession {
    host: String,
    ssh_config: Option<PathBuf>,
    control_dir: tempfile::TempDir,
}

impl OpenSshSession {
    /// Open the control connection to `host` (a `Host` alias when
    /// `ssh_config` is given).
    pub async fn connect(host: &str, ssh_config: Option<&Path>) -> ChillboxResult<Self> {
        let control_dir = tempfile::Builder::new()
            .prefix("chillbox-ssh-")
            .tempdir()?;
        let mut session = Self {
            host: host.to_string(),
            ssh_config: ssh_config.map(Path::to_path_buf),
            control_dir,
        };
        session.run("true").await?.check("ssh connection test")?;
        tracing::info!(host = %host, "connected");
        Ok(session)
    }

    fn control_path(&self) -> PathBuf {
        self.control_dir.path().join("control")
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.ssh_config {
            args.push("-F".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args.push("-o".into());
        args.push("ControlMaster=auto".into());
        args.push("-o".into());
        args.push(format!("ControlPath={}", self.control_path().display()));
        args.push("-o".into());
        args.push("ControlPersist=60".into());
        args
    }

    async fn exec(program: &str, args: &[String]) -> ChillboxResult<RemoteOutput> {
        tracing::debug!(program, ?args, "running");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ChillboxError::Dependency(format!("the {program} command was not found on PATH"))
                }
                _ => ChillboxError::Remote(format!("spawning {program}: {e}")),
            })?;
        Ok(RemoteOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

impl RemoteSession for OpenSshSession {
    async fn put(&mut self, local: &Path, remote: &str) -> ChillboxResult<()> {
        let mut args = self.common_args();
        args.push("-q".into());
        args.push(local.to_string_lossy().into_owned());
        args.push(format!("{}:{remote}", self.host));
        Self::exec("scp", &args).await?.check("scp upload")?;
        Ok(())
    }

    async fn get(&mut self, remote: &str, local: &Path) -> ChillboxResult<()> {
        let mut args = self.common_args();
        args.push("-q".into());
        args.push(format!("{}:{remote}", self.host));
        args.push(local.to_string_lossy().into_owned());
        Self::exec("scp", &args).await?.check("scp download")?;
        Ok(())
    }

    async fn run(&mut self, command: &str) -> ChillboxResult<RemoteOutput> {
        let mut args = self.common_args();
        args.push(self.host.clone());
        args.push(command.to_string());
        Self::exec("ssh", &args).await
    }

    async fn close(&mut self) -> ChillboxResult<()> {
        let mut args = self.common_args();
        args.push("-O".into());
        args.push("exit".into());
        args.push(self.host.clone());
        let output = Self::exec("ssh", &args).await?;
        if !output.success() {
            tracing::debug!(host = %self.host, "control master already closed: {}", output.stderr.trim());
        }
        Ok(())
    }
}

//! Distribution of archive entries to remote servers.
//!
//! For one server:
//!   1. Fetch the server's public key from its well-known path.
//!   2. For each `remote-files` entry the operator may access, decrypt the
//!      local ciphertext. Sensitive entries are re-encrypted to the server key
//!      and placed under `{sensitive-root}/{operator}{dest}`; the rest are
//!      uploaded as gzip/tar.gz and unpacked remotely.
//!   3. Group the server's owned secrets by `dest` into `NAME=value` payloads,
//!      re-encrypt each to the server key, and place it like a sensitive file.
//!
//! Every upload lands in a remote `/tmp/chillbox-{uuid}` first and reaches
//! its destination through `mv -f`, so a failed transfer never leaves a
//! partial file at the final path. A failing entry is recorded and the rest
//! still run.

use std::collections::BTreeMap;

use chillbox_core::config::{ChillboxConfig, PathEntry, Server};
use chillbox_core::{shell, ArchiveLayout, ChillboxError, ChillboxResult, EntryFailure, Identity};
use chillbox_secrets::{CryptoTool, SecretsVault, ShredGuard, UnlockedKey};
use secrecy::ExposeSecret;
use zeroize::Zeroizing;

use crate::remote::RemoteSession;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DistributionReport {
    pub server: String,
    pub uploaded: Vec<String>,
    pub skipped: Vec<(String, String)>,
    pub failures: Vec<EntryFailure>,
}

impl DistributionReport {
    /// Convert collected failures into one error.
    pub fn into_result(self) -> ChillboxResult<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ChillboxError::Distribution {
                server: self.server,
                failures: self.failures,
            })
        }
    }
}

fn remote_temp_path() -> String {
    format!("/tmp/chillbox-{}", uuid::Uuid::new_v4())
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

pub struct DistributionUploader<'a> {
    config: &'a ChillboxConfig,
    layout: &'a ArchiveLayout,
    crypto: &'a dyn CryptoTool,
    identity: &'a Identity,
    key: &'a UnlockedKey,
}

impl<'a> DistributionUploader<'a> {
    pub fn new(
        config: &'a ChillboxConfig,
        layout: &'a ArchiveLayout,
        crypto: &'a dyn CryptoTool,
        identity: &'a Identity,
        key: &'a UnlockedKey,
    ) -> Self {
        Self {
            config,
            layout,
            crypto,
            identity,
            key,
        }
    }

    /// Remote path for re-encrypted content owned by the operator.
    pub fn sensitive_path(&self, dest: &str) -> String {
        format!(
            "{}/{}{}",
            self.config.sensitive_root.trim_end_matches('/'),
            self.identity.name,
            dest
        )
    }

    /// A server with an `owner` only takes uploads from that operator.
    pub fn may_upload(&self, server: &Server) -> bool {
        self.identity.may_access(server.owner.as_deref())
    }

    pub async fn distribute<S: RemoteSession>(
        &self,
        session: &mut S,
        server: &Server,
    ) -> ChillboxResult<DistributionReport> {
        if !self.may_upload(server) {
            tracing::info!(server = %server.name, "skipping server owned by another operator");
            return Ok(DistributionReport {
                server: server.name.clone(),
                skipped: vec![(
                    server.name.clone(),
                    format!("owned by {}", server.owner.as_deref().unwrap_or_default()),
                )],
                ..Default::default()
            });
        }

        let output = session
            .run(&format!("cat {}", shell::quote(&self.config.server_public_key_path)))
            .await?
            .check("fetching the server public key")?;
        let server_key = output.stdout.trim().to_string();
        if server_key.is_empty() {
            return Err(ChillboxError::Remote(format!(
                "the server '{}' has an empty public key at {}",
                server.name, self.config.server_public_key_path
            )));
        }

        let mut report = DistributionReport {
            server: server.name.clone(),
            ..Default::default()
        };

        for id in &server.remote_files {
            let Some(entry) = self.config.path(id) else {
                report.failures.push(EntryFailure::new(id, "no such path in the configuration"));
                continue;
            };
            if !self.identity.may_access(entry.owner.as_deref()) {
                tracing::info!(server = %server.name, path_id = %id, "skipping path owned by someone else");
                report
                    .skipped
                    .push((id.clone(), format!("owned by {}", entry.owner.as_deref().unwrap_or_default())));
                continue;
            }
            match self.upload_path(session, entry, &server_key).await {
                Ok(()) => {
                    tracing::info!(server = %server.name, path_id = %id, dest = %entry.dest, "uploaded path");
                    report.uploaded.push(id.clone());
                }
                Err(e) => {
                    tracing::warn!(server = %server.name, path_id = %id, "upload failed: {e}");
                    report.failures.push(EntryFailure::new(id, e));
                }
            }
        }

        self.upload_secrets(session, server, &server_key, &mut report)
            .await;

        Ok(report)
    }

    async fn upload_path<S: RemoteSession>(
        &self,
        session: &mut S,
        entry: &PathEntry,
        server_key: &str,
    ) -> ChillboxResult<()> {
        let archived = self.layout.path(&entry.id);
        let ciphertext = std::fs::read(&archived)
            .map_err(|e| ChillboxError::MissingFile(format!("{}: {e}", archived.display())))?;
        let payload = self.crypto.decrypt(&self.key.private_key()?, &ciphertext)?;

        if entry.sensitive {
            let sealed = self.crypto.encrypt(server_key, &payload)?;
            return self
                .place_file(session, &sealed, &self.sensitive_path(&entry.dest))
                .await;
        }

        let remote_tmp = remote_temp_path();
        self.put_bytes(session, &payload, &remote_tmp).await?;

        let dest = shell::quote(&entry.dest);
        let staged = shell::quote(&format!("{}.chillbox-tmp", entry.dest));
        let parent = shell::quote(parent_dir(&entry.dest));
        let tmp = shell::quote(&remote_tmp);
        let command = if entry.src.is_directory() {
            format!(
                "mkdir -p {parent} && rm -rf {staged} && mkdir -p {staged} \
                 && tar -x -z -f {tmp} -C {staged} --strip-components 1 \
                 && rm -rf {dest} && mv -f {staged} {dest}; status=$?; rm -f {tmp}; exit $status"
            )
        } else {
            format!(
                "mkdir -p {parent} && gunzip -c {tmp} > {staged} \
                 && mv -f {staged} {dest}; status=$?; rm -f {tmp} {staged}; exit $status"
            )
        };
        session.run(&command).await?.check("unpacking upload")?;
        Ok(())
    }

    async fn upload_secrets<S: RemoteSession>(
        &self,
        session: &mut S,
        server: &Server,
        server_key: &str,
        report: &mut DistributionReport,
    ) {
        let vault = SecretsVault::new(self.layout, self.crypto, self.identity);
        let mut by_dest: BTreeMap<&str, (Vec<&str>, Zeroizing<String>)> = BTreeMap::new();

        for id in &server.secrets {
            let Some(secret) = self.config.secret(id) else {
                report.failures.push(EntryFailure::new(id, "no such secret in the configuration"));
                continue;
            };
            if !self.identity.owns(secret.owner.as_deref()) {
                tracing::info!(server = %server.name, secret = %id, "skipping secret not owned by {}", self.identity);
                report.skipped.push((id.clone(), "not owned by the current user".into()));
                continue;
            }
            let Some(dest) = secret.dest.as_deref() else {
                report.skipped.push((id.clone(), "no dest".into()));
                continue;
            };
            match vault.decrypt_for_use(secret, self.key) {
                Ok(value) => {
                    let (ids, lines) = by_dest
                        .entry(dest)
                        .or_insert_with(|| (Vec::new(), Zeroizing::new(String::new())));
                    ids.push(id);
                    lines.push_str(&secret.name);
                    lines.push('=');
                    lines.push_str(value.expose_secret());
                    lines.push('\n');
                }
                Err(e) => report.failures.push(EntryFailure::new(id, e)),
            }
        }

        for (dest, (ids, lines)) in by_dest {
            let result = match self.crypto.encrypt(server_key, lines.as_bytes()) {
                Ok(sealed) => self.place_file(session, &sealed, &self.sensitive_path(dest)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tracing::info!(server = %server.name, dest = %dest, count = ids.len(), "uploaded secrets");
                    report.uploaded.extend(ids.iter().map(|id| id.to_string()));
                }
                Err(e) => {
                    let message = e.to_string();
                    report
                        .failures
                        .extend(ids.iter().map(|id| EntryFailure::new(*id, &message)));
                }
            }
        }
    }

    /// Upload `bytes` and move them into place as an owner-only file.
    async fn place_file<S: RemoteSession>(
        &self,
        session: &mut S,
        bytes: &[u8],
        remote: &str,
    ) -> ChillboxResult<()> {
        let remote_tmp = remote_temp_path();
        self.put_bytes(session, bytes, &remote_tmp).await?;
        let command = format!(
            "mkdir -p {parent} && chmod 0600 {tmp} && mv -f {tmp} {dest}; status=$?; rm -f {tmp}; exit $status",
            parent = shell::quote(parent_dir(remote)),
            tmp = shell::quote(&remote_tmp),
            dest = shell::quote(remote),
        );
        session.run(&command).await?.check("placing upload")?;
        Ok(())
    }

    /// Stage `bytes` in a local temp file, upload it, and shred the local
    /// copy whatever the outcome.
    async fn put_bytes<S: RemoteSession>(
        &self,
        session: &mut S,
        bytes: &[u8],
        remote: &str,
    ) -> ChillboxResult<()> {
        let local = ShredGuard::temp("chillbox-upload-")?;
        std::fs::write(local.path(), bytes)?;
        let result = session.put(local.path(), remote).await;
        local.shred()?;
        result
    }
}

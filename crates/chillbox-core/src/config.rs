//! `chillbox.toml` schema.
//!
//! The file is parsed into `Raw*` structs that mirror the TOML layout, then
//! validated into the closed [`ChillboxConfig`] schema. Every relative path in
//! the file is resolved against the directory holding the config file (the
//! *working directory*). Nothing here touches key material, so validation
//! always completes before any cryptographic operation starts.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ChillboxError, ChillboxResult};

pub const DEFAULT_CONFIG_FILE: &str = "chillbox.toml";
pub const DEFAULT_SENSITIVE_ROOT: &str = "/var/lib/chillbox/sensitive";
pub const DEFAULT_SERVER_PUBLIC_KEY_PATH: &str =
    "/usr/local/share/chillbox/key/chillbox_server.public.pem";

const MORE_INFO: &str = "Please see documentation at docs/configuration-file.md";

// ── Raw TOML layout ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawConfig {
    pub instance: Option<String>,
    pub archive_directory: Option<PathBuf>,
    pub gpg_key: Option<String>,
    pub sensitive_root: Option<String>,
    pub server_public_key_path: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub template: Vec<RawTemplate>,
    #[serde(default)]
    pub user: Vec<RawUser>,
    #[serde(default)]
    pub secret: Vec<RawSecret>,
    #[serde(default)]
    pub path: Vec<RawPath>,
    #[serde(default)]
    pub server: Vec<RawServer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawTemplate {
    pub prefix: Option<String>,
    pub src: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawUser {
    pub name: Option<String>,
    pub gpg_key: Option<String>,
    #[serde(default)]
    pub public_ssh_keys: Vec<String>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawSecret {
    pub id: Option<String>,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub prompt: Option<String>,
    pub expires: Option<toml::value::Datetime>,
    pub dest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawPath {
    pub id: Option<String>,
    pub src: Option<String>,
    pub dest: Option<String>,
    #[serde(default)]
    pub render: bool,
    pub context: Option<toml::Table>,
    #[serde(default)]
    pub sensitive: bool,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawServer {
    pub name: Option<String>,
    pub host: Option<String>,
    pub owner: Option<String>,
    #[serde(default)]
    pub login_users: Vec<String>,
    #[serde(default)]
    pub no_home_users: Vec<String>,
    #[serde(default)]
    pub remote_files: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    pub user_data: Option<RawUserData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawUserData {
    pub template: Option<String>,
    pub file_size_limit: Option<usize>,
    pub context: Option<toml::Table>,
}

// ── Validated schema ────────────────────────────────────────────────────────

/// Template context values, converted from TOML tables.
pub type Context = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct ChillboxConfig {
    pub instance: String,
    /// Directory containing the config file; relative paths resolve against it.
    pub working_directory: PathBuf,
    pub archive_directory: PathBuf,
    pub gpg_key: Option<String>,
    pub sensitive_root: String,
    pub server_public_key_path: String,
    pub env: BTreeMap<String, String>,
    pub templates: Vec<TemplateSource>,
    pub users: Vec<User>,
    pub secrets: Vec<Secret>,
    pub paths: Vec<PathEntry>,
    pub servers: Vec<Server>,
}

/// A `prefix:` namespace mapped to a template directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub prefix: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub gpg_key: String,
    pub public_ssh_keys: Vec<String>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub id: String,
    /// Environment-style variable name the value is exposed under.
    pub name: String,
    /// Secrets without an owner are never owned by anyone and always skipped.
    pub owner: Option<String>,
    pub prompt: String,
    pub expires: Option<NaiveDate>,
    /// Remote file the `NAME=value` line is appended to when distributed.
    pub dest: Option<String>,
}

/// Where a path entry's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSource {
    /// `prefix:name` reference resolved through the renderer's loaders.
    Template(String),
    /// A plain file rendered as a template (`render = true`).
    TemplateFile(PathBuf),
    File(PathBuf),
    Directory(PathBuf),
}

impl PathSource {
    pub fn is_directory(&self) -> bool {
        matches!(self, PathSource::Directory(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathEntry {
    pub id: String,
    pub src: PathSource,
    /// Absolute destination on the remote server.
    pub dest: String,
    pub context: Context,
    pub sensitive: bool,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserData {
    pub template: String,
    pub file_size_limit: Option<usize>,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub name: String,
    pub host: String,
    pub owner: Option<String>,
    pub login_users: Vec<String>,
    pub no_home_users: Vec<String>,
    pub remote_files: Vec<String>,
    pub secrets: Vec<String>,
    pub user_data: Option<UserData>,
}

impl ChillboxConfig {
    /// Read, parse, and validate a config file.
    pub fn load(path: &Path) -> ChillboxResult<Self> {
        if !path.exists() {
            return Err(ChillboxError::MissingFile(format!(
                "no chillbox configuration file at: {}\n    {MORE_INFO}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let working_directory = config_working_directory(path)?;
        Self::from_toml_str(&content, &working_directory)
    }

    /// Parse and validate config text whose relative paths resolve against
    /// `working_directory`.
    pub fn from_toml_str(content: &str, working_directory: &Path) -> ChillboxResult<Self> {
        let raw: RawConfig = toml::from_str(content).map_err(|e| {
            ChillboxError::InvalidConfig(format!("failed to parse the config file.\n  {e}"))
        })?;
        validate(raw, working_directory)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn secret(&self, id: &str) -> Option<&Secret> {
        self.secrets.iter().find(|s| s.id == id)
    }

    pub fn path(&self, id: &str) -> Option<&PathEntry> {
        self.paths.iter().find(|p| p.id == id)
    }

    pub fn server(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// The gpg key that protects the local private key for `user`: the
    /// user's own key when configured, else the top-level `gpg-key`.
    pub fn gpg_key_for(&self, user: &str) -> Option<&str> {
        self.user(user)
            .map(|u| u.gpg_key.as_str())
            .or(self.gpg_key.as_deref())
    }
}

/// Canonical parent directory of a config file path.
pub fn config_working_directory(config_file: &Path) -> ChillboxResult<PathBuf> {
    let canonical = std::fs::canonicalize(config_file)?;
    Ok(canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/")))
}

/// True when `src` is a `prefix:name` template reference rather than a path.
///
/// Absolute and `./` paths are never templates, and neither is an existing
/// directory. The prefix may not contain a `/`.
pub fn is_template_ref(src: &str, working_directory: &Path) -> bool {
    if src.starts_with('/') || src.starts_with("./") {
        return false;
    }
    if working_directory.join(src).is_dir() {
        return false;
    }
    match src.split_once(':') {
        Some((prefix, rest)) => !prefix.is_empty() && !prefix.contains('/') && !rest.is_empty(),
        None => false,
    }
}

/// Resolve `relative` under `working_directory`, following symlinks, and
/// reject anything that lands outside of it.
pub fn resolve_inside(working_directory: &Path, relative: &Path) -> ChillboxResult<PathBuf> {
    let joined = working_directory.join(relative);
    let resolved = std::fs::canonicalize(&joined).map_err(|e| {
        ChillboxError::InvalidConfig(format!("the path {} does not exist: {e}", joined.display()))
    })?;
    if !resolved.starts_with(working_directory) {
        return Err(ChillboxError::InvalidConfig(format!(
            "the path ({}) is outside the working directory: {}",
            resolved.display(),
            working_directory.display()
        )));
    }
    Ok(resolved)
}

fn require(value: Option<String>, what: &str, object: &str) -> ChillboxResult<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ChillboxError::InvalidConfig(format!(
            "missing required key '{what}' for {object}\n    {MORE_INFO}"
        ))),
    }
}

/// Ids and server names become file names inside the archive directory.
fn require_name(value: Option<String>, what: &str, object: &str) -> ChillboxResult<String> {
    let name = require(value, what, object)?;
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(ChillboxError::InvalidConfig(format!(
            "the {what} '{name}' on {object} can not be used as a file name"
        )));
    }
    Ok(name)
}

fn check_unique<'a>(values: impl Iterator<Item = &'a str>, what: &str) -> ChillboxResult<()> {
    let mut seen = HashSet::new();
    for v in values {
        if !seen.insert(v) {
            return Err(ChillboxError::InvalidConfig(format!(
                "duplicate {what} found: '{v}'. The {what} must be unique."
            )));
        }
    }
    Ok(())
}

fn toml_table_to_context(table: Option<toml::Table>) -> ChillboxResult<Context> {
    let Some(table) = table else {
        return Ok(Context::new());
    };
    match serde_json::to_value(table) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Context::new()),
        Err(e) => Err(ChillboxError::InvalidConfig(format!("invalid context table: {e}"))),
    }
}

fn toml_date(id: &str, dt: toml::value::Datetime) -> ChillboxResult<NaiveDate> {
    let date = dt.date.ok_or_else(|| {
        ChillboxError::InvalidConfig(format!("the secret '{id}' has an expires value without a date"))
    })?;
    NaiveDate::from_ymd_opt(i32::from(date.year), u32::from(date.month), u32::from(date.day))
        .ok_or_else(|| {
            ChillboxError::InvalidConfig(format!("the secret '{id}' has an invalid expires date"))
        })
}

fn env_value_to_string(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn validate(raw: RawConfig, working_directory: &Path) -> ChillboxResult<ChillboxConfig> {
    let instance = require(raw.instance, "instance", "the config file")?;
    let archive_directory = raw.archive_directory.ok_or_else(|| {
        ChillboxError::InvalidConfig(format!(
            "missing required key 'archive-directory' for the config file\n    {MORE_INFO}"
        ))
    })?;
    let archive_directory = working_directory.join(archive_directory);

    // users
    let mut users = Vec::with_capacity(raw.user.len());
    for u in raw.user {
        let name = require(u.name, "name", "user")?;
        let gpg_key = require(u.gpg_key, "gpg-key", &format!("user '{name}'"))?;
        users.push(User {
            name,
            gpg_key,
            public_ssh_keys: u.public_ssh_keys,
            password_hash: u.password_hash,
        });
    }
    check_unique(users.iter().map(|u| u.name.as_str()), "user name")?;

    // templates
    let mut templates = Vec::with_capacity(raw.template.len());
    for t in raw.template {
        let (Some(prefix), Some(src)) = (t.prefix, t.src) else {
            return Err(ChillboxError::InvalidConfig(
                "each template must set a prefix and a src".into(),
            ));
        };
        let dir = resolve_inside(working_directory, &src)?;
        if !dir.is_dir() {
            return Err(ChillboxError::InvalidConfig(format!(
                "the template src path is not a directory: {}",
                dir.display()
            )));
        }
        templates.push(TemplateSource { prefix, dir });
    }
    check_unique(templates.iter().map(|t| t.prefix.as_str()), "template prefix")?;

    // secrets
    let today = chrono::Local::now().date_naive();
    let mut secrets = Vec::with_capacity(raw.secret.len());
    for s in raw.secret {
        let id = require_name(s.id, "id", "secret")?;
        let name = require(s.name, "name", &format!("secret '{id}'"))?;
        let expires = s.expires.map(|dt| toml_date(&id, dt)).transpose()?;
        if let Some(expires) = expires {
            if today > expires {
                tracing::warn!(secret = %id, %expires, "the secret has expired");
            }
        }
        if let Some(dest) = &s.dest {
            if !Path::new(dest).is_absolute() {
                return Err(ChillboxError::InvalidConfig(format!(
                    "the dest value on secret '{id}' should be an absolute path: {dest}"
                )));
            }
        }
        secrets.push(Secret {
            prompt: s.prompt.unwrap_or_else(|| format!("Enter the value for {name}")),
            id,
            name,
            owner: s.owner,
            expires,
            dest: s.dest,
        });
    }
    check_unique(secrets.iter().map(|s| s.id.as_str()), "secret id")?;

    // paths
    let mut paths = Vec::with_capacity(raw.path.len());
    for p in raw.path {
        let id = require_name(p.id, "id", "path")?;
        let object = format!("path '{id}'");
        let src = require(p.src, "src", &object)?;
        let dest = require(p.dest, "dest", &object)?;

        if p.sensitive && p.owner.is_none() {
            return Err(ChillboxError::InvalidConfig(format!(
                "the path with id of '{id}' is marked as 'sensitive', but has no 'owner' set. \
                 All sensitive paths must have an owner."
            )));
        }
        if !Path::new(&dest).is_absolute() {
            return Err(ChillboxError::InvalidConfig(format!(
                "the dest value on path with id of '{id}' should be an absolute path: {dest}"
            )));
        }
        if p.context.is_some() && !p.render {
            tracing::warn!(
                path_id = %id,
                "the path has a 'context' value, but it will not be used since 'render' is not true"
            );
        }

        let src = if p.render && is_template_ref(&src, working_directory) {
            let prefix = src.split_once(':').map(|(prefix, _)| prefix).unwrap_or_default();
            if !templates.iter().any(|t| t.prefix == prefix) {
                return Err(ChillboxError::InvalidConfig(format!(
                    "the path with id of '{id}' uses the unknown template prefix '{prefix}'"
                )));
            }
            PathSource::Template(src)
        } else {
            let resolved = resolve_inside(working_directory, Path::new(&src)).map_err(|e| {
                ChillboxError::InvalidConfig(format!("the path with id of '{id}' has a bad src: {e}"))
            })?;
            if resolved.is_dir() {
                PathSource::Directory(resolved)
            } else if p.render {
                PathSource::TemplateFile(resolved)
            } else {
                PathSource::File(resolved)
            }
        };

        paths.push(PathEntry {
            id,
            src,
            dest,
            context: toml_table_to_context(p.context)?,
            sensitive: p.sensitive,
            owner: p.owner,
        });
    }
    check_unique(paths.iter().map(|p| p.id.as_str()), "path id")?;

    // servers
    let mut servers = Vec::with_capacity(raw.server.len());
    for s in raw.server {
        let name = require_name(s.name, "name", "server")?;
        let user_data = match s.user_data {
            Some(ud) => Some(UserData {
                template: require(ud.template, "template", &format!("server '{name}' user-data"))?,
                file_size_limit: ud.file_size_limit,
                context: toml_table_to_context(ud.context)?,
            }),
            None => None,
        };
        for file in &s.remote_files {
            if !paths.iter().any(|p| &p.id == file) {
                return Err(ChillboxError::InvalidConfig(format!(
                    "the server '{name}' references an unknown path in remote-files: '{file}'"
                )));
            }
        }
        for secret in &s.secrets {
            if !secrets.iter().any(|x| &x.id == secret) {
                return Err(ChillboxError::InvalidConfig(format!(
                    "the server '{name}' references an unknown secret: '{secret}'"
                )));
            }
        }
        servers.push(Server {
            host: s.host.unwrap_or_else(|| name.clone()),
            name,
            owner: s.owner,
            login_users: s.login_users,
            no_home_users: s.no_home_users,
            remote_files: s.remote_files,
            secrets: s.secrets,
            user_data,
        });
    }
    check_unique(servers.iter().map(|s| s.name.as_str()), "server name")?;

    tracing::info!(%instance, "valid configuration");

    Ok(ChillboxConfig {
        instance,
        working_directory: working_directory.to_path_buf(),
        archive_directory,
        gpg_key: raw.gpg_key,
        sensitive_root: raw
            .sensitive_root
            .unwrap_or_else(|| DEFAULT_SENSITIVE_ROOT.into()),
        server_public_key_path: raw
            .server_public_key_path
            .unwrap_or_else(|| DEFAULT_SERVER_PUBLIC_KEY_PATH.into()),
        env: raw
            .env
            .into_iter()
            .map(|(k, v)| (k, env_value_to_string(v)))
            .collect(),
        templates,
        users,
        secrets,
        paths,
        servers,
    })
}

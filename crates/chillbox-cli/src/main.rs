//! chillbox: build an encrypted deployment archive and distribute it
//!
//! Archive commands (each runs `init` first):
//!   init                       - build or refresh the local archive
//!   server-init                - render user-data for servers that declare it
//!   upload [--server NAME]     - distribute files and secrets to servers
//!   show <path-id>             - decrypt one archived path into a temp dir
//!   output-env [--sensitive]   - write env vars (and owned secrets) to a temp file
//!   ssh-unlock                 - decrypt the chillbox ssh identity and config
//!
//! Housekeeping:
//!   clean, output-env-clean, ssh-lock, config show

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tracing::{info, warn};

use chillbox_archive::state::{ArchiveState, CURRENT_USER, SSH_CONFIG_TEMP};
use chillbox_archive::{output_env, show, template_context, userdata, PathProcessor, TemplateRenderer};
use chillbox_core::config::{ChillboxConfig, DEFAULT_CONFIG_FILE};
use chillbox_core::{ArchiveLayout, Identity};
use chillbox_deploy::{OpenSshSession, RemoteSession};
use chillbox_secrets::{
    ensure_gpg_key, AgeTool, GpgMasterKey, KeyManager, MasterKey, PassphraseMasterKey, Prompter,
    SecretsVault, TerminalPrompter, UnlockedKey,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "chillbox",
    version,
    about = "Encrypted deployment archive manager",
    long_about = "chillbox: keep files, templates, and secrets in a local encrypted archive \
                  and distribute them to servers"
)]
struct Cli {
    /// Path to the chillbox.toml configuration file
    #[arg(long, short = 'c', env = "CHILLBOX_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log progress (same as --log info)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Log debug details (same as --log debug)
    #[arg(long, global = true)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CHILLBOX_LOG", default_value = "warn", global = true)]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "CHILLBOX_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or refresh the archive: keys, secrets, and paths
    Init,

    /// Remove the archive directory after confirmation
    Clean,

    /// Render user-data for every server that declares it
    #[command(name = "server-init")]
    ServerInit,

    /// Distribute files and secrets to servers
    Upload {
        /// Only this server (default: every configured server)
        #[arg(long, short = 's')]
        server: Option<String>,
    },

    /// Decrypt one archived path into a temporary directory
    Show {
        /// Path id from the configuration
        path_id: String,
        /// Allow showing a path marked sensitive
        #[arg(long)]
        sensitive: bool,
    },

    /// Write env values to a temp file and print its path
    #[command(name = "output-env")]
    OutputEnv {
        /// Include the decrypted secrets owned by the current user
        #[arg(long)]
        sensitive: bool,
    },

    /// Shred the file written by output-env
    #[command(name = "output-env-clean")]
    OutputEnvClean,

    /// Decrypt the chillbox ssh identity and print an ssh_config path
    #[command(name = "ssh-unlock")]
    SshUnlock,

    /// Shred the files written by ssh-unlock
    #[command(name = "ssh-lock")]
    SshLock,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Validate and summarize the configuration
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(log_level(&cli), &cli.log_format);

    match cli.command {
        Commands::Init => cmd_init(&cli.config).await,
        Commands::Clean => cmd_clean(&cli.config),
        Commands::ServerInit => cmd_server_init(&cli.config).await,
        Commands::Upload { server } => cmd_upload(&cli.config, server.as_deref()).await,
        Commands::Show { path_id, sensitive } => cmd_show(&cli.config, &path_id, sensitive).await,
        Commands::OutputEnv { sensitive } => cmd_output_env(&cli.config, sensitive).await,
        Commands::OutputEnvClean => cmd_output_env_clean(&cli.config),
        Commands::SshUnlock => cmd_ssh_unlock(&cli.config).await,
        Commands::SshLock => cmd_ssh_lock(&cli.config),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&cli.config),
    }
}

fn log_level(cli: &Cli) -> &str {
    if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        &cli.log
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Invocation context ────────────────────────────────────────────────────────

/// Everything one command invocation works with.
struct Invocation {
    config: ChillboxConfig,
    layout: ArchiveLayout,
    identity: Identity,
    state: ArchiveState,
    crypto: AgeTool,
}

/// The unlocked private key plus the secrets it decrypted. The key must be
/// released before the invocation ends.
struct Unlocked {
    key: UnlockedKey,
    secrets: BTreeMap<String, SecretString>,
}

impl Invocation {
    /// Load the configuration, prepare the archive directory, and clean up
    /// after any earlier run that did not finish.
    fn open(config_path: &Path) -> Result<Self> {
        let config = ChillboxConfig::load(config_path)
            .with_context(|| format!("loading config: {}", config_path.display()))?;
        let identity = Identity::current()?;
        let layout = ArchiveLayout::new(&config.archive_directory, &config.instance);
        layout.init()?;

        let mut state = ArchiveState::open(&layout.state_file())?;
        let report = state.cleanup_previous_run()?;
        for path in &report.shredded {
            warn!(path = %path.display(), "shredded an unlocked key left by an earlier run");
        }

        Ok(Self {
            config,
            layout,
            identity,
            state,
            crypto: AgeTool,
        })
    }

    fn master_key(&self, prompter: &dyn Prompter) -> Result<Box<dyn MasterKey>> {
        match self.config.gpg_key_for(&self.identity.name) {
            Some(gpg_key) => {
                if ensure_gpg_key(gpg_key)? {
                    info!(gpg_key, "created gpg key");
                }
                Ok(Box::new(GpgMasterKey::new(gpg_key)))
            }
            None => {
                let new_key = !self.layout.private_key().exists();
                Ok(Box::new(PassphraseMasterKey::prompt(prompter, new_key)?))
            }
        }
    }

    /// The `init` pipeline. On success the key stays unlocked for the caller.
    async fn init(&mut self) -> Result<Unlocked> {
        let prompter = TerminalPrompter;
        let master = self.master_key(&prompter)?;
        self.state.set(CURRENT_USER, &self.identity.name)?;

        let keys = KeyManager::new(&self.layout, &self.crypto, master.as_ref());
        if keys.ensure_key_pair()? {
            info!(instance = %self.config.instance, "created local key pair");
        }
        let key = keys.unlock_private_key(&mut self.state)?;

        match self.build(&key, &prompter).await {
            Ok(secrets) => Ok(Unlocked { key, secrets }),
            Err(e) => {
                self.release(key);
                Err(e)
            }
        }
    }

    async fn build(
        &mut self,
        key: &UnlockedKey,
        prompter: &dyn Prompter,
    ) -> Result<BTreeMap<String, SecretString>> {
        if chillbox_deploy::ensure_user_ssh_key(&self.layout, &mut self.state, &self.crypto, &self.identity)
            .await?
        {
            info!(user = %self.identity, "created chillbox ssh key");
        }

        let vault = SecretsVault::new(&self.layout, &self.crypto, &self.identity);
        let today = chrono::Local::now().date_naive();
        let synced = vault.sync_secrets(&self.config.secrets, prompter, today)?;
        for (id, reason) in &synced.skipped {
            info!(secret = %id, "skipped secret: {reason}");
        }
        let secrets = vault.load_secrets(&self.config.secrets, key)?;

        let renderer = TemplateRenderer::new(&self.config.templates, &self.config.working_directory);
        let built = PathProcessor::new(&self.layout, &self.crypto, &renderer, &self.identity)
            .build_archive(
                &self.config.paths,
                &template_context(&self.config.env, &secrets),
                key,
            )?;
        info!(
            written = built.written.len(),
            unchanged = built.unchanged.len(),
            skipped = built.skipped.len(),
            "archive built"
        );
        Ok(secrets)
    }

    /// Shred the unlocked key and clear its record.
    fn release(&mut self, key: UnlockedKey) {
        if let Err(e) = key.release(&mut self.state) {
            warn!("releasing the unlocked key: {e}");
        }
    }
}

// ── `chillbox init` ───────────────────────────────────────────────────────────

async fn cmd_init(config_path: &Path) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    let unlocked = inv.init().await?;
    inv.release(unlocked.key);
    info!(archive = %inv.layout.root().display(), "init complete");
    Ok(())
}

// ── `chillbox clean` ──────────────────────────────────────────────────────────

fn cmd_clean(config_path: &Path) -> Result<()> {
    let config = ChillboxConfig::load(config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;
    let layout = ArchiveLayout::new(&config.archive_directory, &config.instance);
    if !layout.root().exists() {
        println!("No archive directory at {}", layout.root().display());
        return Ok(());
    }

    let prompt = format!(
        "Delete the archive directory {} and everything in it?",
        layout.root().display()
    );
    if !TerminalPrompter.confirm(&prompt)? {
        println!("Not deleting the archive directory.");
        return Ok(());
    }

    // shred plaintext temp files outside the archive before the records go away
    if layout.state_file().exists() {
        let mut state = ArchiveState::open(&layout.state_file())?;
        state.cleanup_previous_run()?;
        chillbox_deploy::ssh_lock(&mut state)?;
        output_env::clean_output_env(&mut state)?;
    }
    chillbox_archive::remove_archive(&layout)?;
    println!("Deleted {}", layout.root().display());
    Ok(())
}

// ── `chillbox server-init` ────────────────────────────────────────────────────

async fn cmd_server_init(config_path: &Path) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    let unlocked = inv.init().await?;

    let result = (|| -> Result<Vec<String>> {
        let operator_keys = inv.state.current_user_data()?.public_ssh_key;
        let renderer = TemplateRenderer::new(&inv.config.templates, &inv.config.working_directory);
        Ok(userdata::generate_server_user_data(
            &inv.layout,
            &inv.config,
            &renderer,
            &inv.identity,
            &operator_keys,
        )?)
    })();
    inv.release(unlocked.key);

    for server in result? {
        println!("{}", inv.layout.server_user_data(&server).display());
    }
    Ok(())
}

// ── `chillbox upload` ─────────────────────────────────────────────────────────

async fn cmd_upload(config_path: &Path, only: Option<&str>) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    if let Some(name) = only {
        if inv.config.server(name).is_none() {
            anyhow::bail!("no server named '{name}' in the configuration");
        }
    }

    let unlocked = inv.init().await?;
    let result = upload(&mut inv, &unlocked.key, only).await;
    inv.release(unlocked.key);
    result
}

async fn upload(inv: &mut Invocation, key: &UnlockedKey, only: Option<&str>) -> Result<()> {
    let was_unlocked = inv.state.temp_path(SSH_CONFIG_TEMP)?.is_some();
    let ssh_config = chillbox_deploy::ssh_unlock(
        &inv.layout,
        &mut inv.state,
        &inv.config,
        &inv.crypto,
        key,
        &inv.identity,
    )?;

    let uploader = chillbox_deploy::DistributionUploader::new(
        &inv.config,
        &inv.layout,
        &inv.crypto,
        &inv.identity,
        key,
    );
    let mut failed = Vec::new();
    for server in inv
        .config
        .servers
        .iter()
        .filter(|s| only.map_or(true, |name| s.name == name))
    {
        if !uploader.may_upload(server) {
            info!(server = %server.name, "skipping server owned by another operator");
            continue;
        }
        // servers the operator logs into have a Host entry in the generated config
        let logs_in = server.login_users.iter().any(|u| *u == inv.identity.name);
        let connected = if logs_in {
            OpenSshSession::connect(&server.name, Some(ssh_config.as_path())).await
        } else {
            OpenSshSession::connect(&server.host, None).await
        };
        let mut session = match connected {
            Ok(session) => session,
            Err(e) => {
                warn!(server = %server.name, "connection failed: {e}");
                failed.push(server.name.clone());
                continue;
            }
        };

        let outcome = uploader
            .distribute(&mut session, server)
            .await
            .and_then(|report| report.into_result());
        if let Err(e) = session.close().await {
            warn!(server = %server.name, "closing the connection: {e}");
        }
        match outcome {
            Ok(report) => {
                println!(
                    "{}: uploaded {}, skipped {}",
                    server.name,
                    report.uploaded.len(),
                    report.skipped.len()
                );
            }
            Err(e) => {
                warn!(server = %server.name, "{e}");
                failed.push(server.name.clone());
            }
        }
    }

    if !was_unlocked {
        chillbox_deploy::ssh_lock(&mut inv.state)?;
    }
    if !failed.is_empty() {
        anyhow::bail!("distribution failed for: {}", failed.join(", "));
    }
    Ok(())
}

// ── `chillbox show` ───────────────────────────────────────────────────────────

async fn cmd_show(config_path: &Path, path_id: &str, sensitive: bool) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    let unlocked = inv.init().await?;
    let result = show::show_path(
        &inv.layout,
        &inv.config,
        &inv.crypto,
        &unlocked.key,
        &inv.identity,
        path_id,
        sensitive,
    );
    inv.release(unlocked.key);
    println!("{}", result?.display());
    Ok(())
}

// ── `chillbox output-env` ─────────────────────────────────────────────────────

async fn cmd_output_env(config_path: &Path, sensitive: bool) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    let unlocked = inv.init().await?;
    let secrets = sensitive.then_some(&unlocked.secrets);
    let result = output_env::write_output_env(&mut inv.state, &inv.config, secrets);
    inv.release(unlocked.key);
    println!("{}", result?.display());
    Ok(())
}

fn cmd_output_env_clean(config_path: &Path) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    match output_env::clean_output_env(&mut inv.state)? {
        Some(path) => info!(path = %path.display(), "shredded output env file"),
        None => info!("no output env file recorded"),
    }
    Ok(())
}

// ── `chillbox ssh-unlock` / `ssh-lock` ────────────────────────────────────────

async fn cmd_ssh_unlock(config_path: &Path) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    let unlocked = inv.init().await?;
    let result = chillbox_deploy::ssh_unlock(
        &inv.layout,
        &mut inv.state,
        &inv.config,
        &inv.crypto,
        &unlocked.key,
        &inv.identity,
    );
    inv.release(unlocked.key);
    println!("{}", result?.display());
    Ok(())
}

fn cmd_ssh_lock(config_path: &Path) -> Result<()> {
    let mut inv = Invocation::open(config_path)?;
    chillbox_deploy::ssh_lock(&mut inv.state)?;
    Ok(())
}

// ── `chillbox config show` ────────────────────────────────────────────────────

fn cmd_config_show(config_path: &Path) -> Result<()> {
    let config = ChillboxConfig::load(config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    println!("# Configuration from: {}", config_path.display());
    println!("instance:          {}", config.instance);
    println!("working directory: {}", config.working_directory.display());
    println!("archive directory: {}", config.archive_directory.display());
    println!("sensitive root:    {}", config.sensitive_root);
    if let Some(gpg_key) = &config.gpg_key {
        println!("gpg key:           {gpg_key}");
    }
    println!();
    println!("templates: {}", join(config.templates.iter().map(|t| t.prefix.as_str())));
    println!("users:     {}", join(config.users.iter().map(|u| u.name.as_str())));
    println!("secrets:   {}", join(config.secrets.iter().map(|s| s.id.as_str())));
    println!("paths:     {}", join(config.paths.iter().map(|p| p.id.as_str())));
    for server in &config.servers {
        println!();
        println!("[server {}]", server.name);
        println!("  host:         {}", server.host);
        println!("  login users:  {}", join(server.login_users.iter().map(String::as_str)));
        println!("  remote files: {}", join(server.remote_files.iter().map(String::as_str)));
        println!("  secrets:      {}", join(server.secrets.iter().map(String::as_str)));
        if let Some(user_data) = &server.user_data {
            println!("  user-data:    {}", user_data.template);
        }
    }
    Ok(())
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let items: Vec<&str> = items.collect();
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_flags_override_log_level() {
        let cli = Cli::parse_from(["chillbox", "init"]);
        assert_eq!(log_level(&cli), "warn");

        let cli = Cli::parse_from(["chillbox", "-v", "init"]);
        assert_eq!(log_level(&cli), "info");

        let cli = Cli::parse_from(["chillbox", "--debug", "-v", "init"]);
        assert_eq!(log_level(&cli), "debug");
    }

    #[test]
    fn upload_takes_an_optional_server() {
        let cli = Cli::parse_from(["chillbox", "upload", "--server", "web1"]);
        assert!(matches!(cli.command, Commands::Upload { server: Some(ref s) } if s == "web1"));

        let cli = Cli::parse_from(["chillbox", "-c", "/srv/site/chillbox.toml", "show", "motd"]);
        assert_eq!(cli.config, PathBuf::from("/srv/site/chillbox.toml"));
        assert!(matches!(cli.command, Commands::Show { ref path_id, sensitive: false } if path_id == "motd"));
    }

    #[test]
    fn join_reports_empty_lists() {
        assert_eq!(join(std::iter::empty()), "(none)");
        assert_eq!(join(["a", "b"].into_iter()), "a, b");
    }
}

//! Distribution against an in-memory remote session.
//!
//! Tests that build an archive change the process umask and run serially.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chillbox_archive::compress::gunzip;
use chillbox_archive::{template_context, ArchiveState, PathProcessor, TemplateRenderer};
use chillbox_core::{ArchiveLayout, ChillboxConfig, ChillboxError, ChillboxResult, Identity};
use chillbox_deploy::{
    render_ssh_config, ssh_lock, ssh_unlock, DistributionUploader, RemoteOutput, RemoteSession,
};
use chillbox_secrets::{AgeTool, CryptoTool, KeyManager, MasterKey, Prompter, SecretsVault, UnlockedKey};
use secrecy::SecretString;
use serial_test::serial;
use zeroize::Zeroizing;

const SERVER_KEY_PATH: &str = "/usr/local/share/chillbox/key/chillbox_server.public.pem";

struct PlainMaster;

impl MasterKey for PlainMaster {
    fn seal(&self, plaintext: &[u8]) -> ChillboxResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }
    fn unseal(&self, ciphertext: &[u8]) -> ChillboxResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(ciphertext.to_vec()))
    }
}

struct Answer(&'static str);

impl Prompter for Answer {
    fn secret(&self, _prompt: &str) -> ChillboxResult<SecretString> {
        Ok(SecretString::from(self.0.to_string()))
    }
    fn confirm(&self, _prompt: &str) -> ChillboxResult<bool> {
        Ok(true)
    }
}

/// Records uploads and commands; `cat` of the key path returns the server key.
#[derive(Default)]
struct FakeSession {
    server_public_key: String,
    uploads: HashMap<String, Vec<u8>>,
    commands: Vec<String>,
    fail_put_for_len: Option<usize>,
    closed: bool,
}

impl RemoteSession for FakeSession {
    async fn put(&mut self, local: &Path, remote: &str) -> ChillboxResult<()> {
        let bytes = std::fs::read(local)?;
        if Some(bytes.len()) == self.fail_put_for_len {
            return Err(ChillboxError::Remote("connection reset".into()));
        }
        self.uploads.insert(remote.to_string(), bytes);
        Ok(())
    }

    async fn get(&mut self, remote: &str, local: &Path) -> ChillboxResult<()> {
        let bytes = self
            .uploads
            .get(remote)
            .ok_or_else(|| ChillboxError::Remote(format!("no such file {remote}")))?;
        std::fs::write(local, bytes)?;
        Ok(())
    }

    async fn run(&mut self, command: &str) -> ChillboxResult<RemoteOutput> {
        self.commands.push(command.to_string());
        if command == format!("cat '{SERVER_KEY_PATH}'") {
            return Ok(RemoteOutput {
                stdout: format!("{}\n", self.server_public_key),
                ..Default::default()
            });
        }
        Ok(RemoteOutput::default())
    }

    async fn close(&mut self) -> ChillboxResult<()> {
        self.closed = true;
        Ok(())
    }
}

const CONFIG: &str = r#"
instance = "example"
archive-directory = ".chillbox"
sensitive-root = "/var/lib/chillbox/sensitive"

[[path]]
id = "motd"
src = "motd"
dest = "/etc/motd"

[[path]]
id = "static"
src = "static"
dest = "/srv/static"

[[path]]
id = "alice-key"
src = "motd"
dest = "/etc/site1/alice.key"
sensitive = true
owner = "alice"

[[path]]
id = "bob-file"
src = "motd"
dest = "/etc/bob"
owner = "bob"

[[secret]]
id = "db-pass"
name = "DB_PASSWORD"
owner = "alice"
dest = "/etc/site1/secrets.env"

[[secret]]
id = "api-token"
name = "API_TOKEN"
owner = "alice"
dest = "/etc/site1/secrets.env"

[[secret]]
id = "bob-secret"
name = "BOB"
owner = "bob"
dest = "/etc/site1/secrets.env"

[[server]]
name = "web1"
host = "web1.example.test"
login-users = ["alice"]
remote-files = ["motd", "static", "alice-key", "bob-file"]
secrets = ["db-pass", "api-token", "bob-secret"]

[[server]]
name = "web2"
host = "web2.example.test"
owner = "bob"
remote-files = ["motd"]
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    config: ChillboxConfig,
    layout: ArchiveLayout,
    state: ArchiveState,
    alice: Identity,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let wd = std::fs::canonicalize(dir.path()).unwrap();
    std::fs::write(wd.join("motd"), "welcome\n").unwrap();
    std::fs::create_dir_all(wd.join("static")).unwrap();
    std::fs::write(wd.join("static/index.html"), "<h1>hi</h1>").unwrap();

    let config = ChillboxConfig::from_toml_str(CONFIG, &wd).unwrap();
    let layout = ArchiveLayout::new(&config.archive_directory, &config.instance);
    layout.init().unwrap();
    KeyManager::new(&layout, &AgeTool, &PlainMaster)
        .ensure_key_pair()
        .unwrap();
    let state = ArchiveState::open(&layout.state_file()).unwrap();
    Fixture {
        _dir: dir,
        config,
        layout,
        state,
        alice: Identity::new("alice"),
    }
}

fn prepare(fx: &mut Fixture) -> UnlockedKey {
    let today = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    SecretsVault::new(&fx.layout, &AgeTool, &fx.alice)
        .sync_secrets(&fx.config.secrets, &Answer("s3cret"), today)
        .unwrap();

    let key = KeyManager::new(&fx.layout, &AgeTool, &PlainMaster)
        .unlock_private_key(&mut fx.state)
        .unwrap();
    let renderer = TemplateRenderer::new(&fx.config.templates, &fx.config.working_directory);
    PathProcessor::new(&fx.layout, &AgeTool, &renderer, &fx.alice)
        .build_archive(
            &fx.config.paths,
            &template_context(&fx.config.env, &BTreeMap::new()),
            &key,
        )
        .unwrap();
    key
}

fn server_keys() -> (SecretString, String) {
    AgeTool.generate_keypair().unwrap()
}

#[tokio::test]
#[serial]
async fn test_distribute_respects_ownership_and_sensitivity() {
    let mut fx = fixture();
    let key = prepare(&mut fx);
    let (server_private, server_public) = server_keys();
    let mut session = FakeSession {
        server_public_key: server_public,
        ..Default::default()
    };

    let server = fx.config.server("web1").unwrap();
    let report = DistributionUploader::new(&fx.config, &fx.layout, &AgeTool, &fx.alice, &key)
        .distribute(&mut session, server)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(
        report.uploaded,
        vec!["motd", "static", "alice-key", "db-pass", "api-token"]
    );
    let skipped: Vec<&str> = report.skipped.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(skipped, vec!["bob-file", "bob-secret"]);

    // every upload goes to a remote temp path first
    assert!(session.uploads.keys().all(|k| k.starts_with("/tmp/chillbox-")));
    assert_eq!(session.uploads.len(), 4);

    // the plain file arrives as gzip and is moved into place
    let motd_move = session
        .commands
        .iter()
        .find(|c| c.contains("'/etc/motd'"))
        .unwrap();
    assert!(motd_move.contains("gunzip -c"));
    assert!(motd_move.contains("mv -f '/etc/motd.chillbox-tmp' '/etc/motd'"));
    let static_move = session
        .commands
        .iter()
        .find(|c| c.contains("'/srv/static'"))
        .unwrap();
    assert!(static_move.contains("--strip-components 1"));

    // sensitive content is encrypted to the server key under the operator's namespace
    assert!(session
        .commands
        .iter()
        .any(|c| c.contains("'/var/lib/chillbox/sensitive/alice/etc/site1/alice.key'")));

    let mut plaintexts: Vec<Vec<u8>> = session
        .uploads
        .values()
        .filter_map(|bytes| AgeTool.decrypt(&server_private, bytes).ok())
        .map(|p| p.to_vec())
        .collect();
    plaintexts.sort();
    assert_eq!(plaintexts.len(), 2);
    assert!(plaintexts.contains(&b"API_TOKEN=s3cret\nDB_PASSWORD=s3cret\n".to_vec())
        || plaintexts.contains(&b"DB_PASSWORD=s3cret\nAPI_TOKEN=s3cret\n".to_vec()));
    assert!(plaintexts
        .iter()
        .any(|p| gunzip(p).map(|t| t == b"welcome\n").unwrap_or(false)));

    key.release(&mut fx.state).unwrap();
}

#[tokio::test]
#[serial]
async fn test_failed_entry_does_not_stop_the_rest() {
    let mut fx = fixture();
    let key = prepare(&mut fx);
    let (_, server_public) = server_keys();

    // the motd payload is the only gzip of exactly this size
    let motd_len = {
        let ciphertext = std::fs::read(fx.layout.path("motd")).unwrap();
        AgeTool
            .decrypt(&key.private_key().unwrap(), &ciphertext)
            .unwrap()
            .len()
    };
    let mut session = FakeSession {
        server_public_key: server_public,
        fail_put_for_len: Some(motd_len),
        ..Default::default()
    };

    let server = fx.config.server("web1").unwrap();
    let report = DistributionUploader::new(&fx.config, &fx.layout, &AgeTool, &fx.alice, &key)
        .distribute(&mut session, server)
        .await
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, "motd");
    assert!(report.uploaded.contains(&"static".to_string()));
    assert!(report.uploaded.contains(&"db-pass".to_string()));

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, ChillboxError::Distribution { ref server, .. } if server == "web1"));

    key.release(&mut fx.state).unwrap();
}

#[tokio::test]
#[serial]
async fn test_server_owned_by_another_operator_is_left_alone() {
    let mut fx = fixture();
    let key = prepare(&mut fx);
    let (_, server_public) = server_keys();
    let mut session = FakeSession {
        server_public_key: server_public,
        ..Default::default()
    };

    let server = fx.config.server("web2").unwrap();
    let uploader = DistributionUploader::new(&fx.config, &fx.layout, &AgeTool, &fx.alice, &key);
    assert!(!uploader.may_upload(server));
    assert!(uploader.may_upload(fx.config.server("web1").unwrap()));

    let report = uploader.distribute(&mut session, server).await.unwrap();
    assert!(report.uploaded.is_empty());
    assert_eq!(
        report.skipped,
        vec![("web2".to_string(), "owned by bob".to_string())]
    );
    assert!(session.commands.is_empty());
    assert!(session.uploads.is_empty());

    key.release(&mut fx.state).unwrap();
}

#[tokio::test]
#[serial]
async fn test_missing_server_key_is_fatal() {
    let mut fx = fixture();
    let key = prepare(&mut fx);
    let mut session = FakeSession::default();

    let server = fx.config.server("web1").unwrap();
    let err = DistributionUploader::new(&fx.config, &fx.layout, &AgeTool, &fx.alice, &key)
        .distribute(&mut session, server)
        .await
        .unwrap_err();
    assert!(matches!(err, ChillboxError::Remote(_)));
    assert!(session.uploads.is_empty());
    session.close().await.unwrap();
    assert!(session.closed);

    key.release(&mut fx.state).unwrap();
}

#[test]
fn test_ssh_config_lists_login_servers() {
    let fx = fixture();
    let identity_file = PathBuf::from("/tmp/chillbox-identity-x");
    let text = render_ssh_config(&fx.config, &fx.layout, &fx.alice, &identity_file);
    assert!(text.contains("Host web1\n"));
    assert!(text.contains("  HostName web1.example.test\n"));
    assert!(text.contains("  User alice\n"));
    assert!(text.contains("  IdentityFile /tmp/chillbox-identity-x\n"));

    let bob = render_ssh_config(&fx.config, &fx.layout, &Identity::new("bob"), &identity_file);
    assert!(bob.is_empty());
}

#[test]
fn test_ssh_lock_shreds_recorded_files() {
    use chillbox_secrets::TempRecords;
    let mut fx = fixture();
    let config = fx.layout.root().join("fake_ssh_config");
    std::fs::write(&config, "Host web1").unwrap();
    fx.state
        .record_temp(chillbox_archive::state::SSH_CONFIG_TEMP, &config)
        .unwrap();
    ssh_lock(&mut fx.state).unwrap();
    assert!(!config.exists());
    assert_eq!(
        fx.state
            .temp_path(chillbox_archive::state::SSH_CONFIG_TEMP)
            .unwrap(),
        None
    );
}

#[test]
#[serial]
fn test_failed_ssh_unlock_leaves_no_records() {
    use chillbox_archive::state::{IDENTITY_FILE_TEMP, SSH_CONFIG_TEMP};
    let mut fx = fixture();
    let key = prepare(&mut fx);
    let stored = fx.layout.user_ssh_key("alice");
    std::fs::create_dir_all(stored.parent().unwrap()).unwrap();
    std::fs::write(&stored, b"not age ciphertext").unwrap();

    let result = ssh_unlock(&fx.layout, &mut fx.state, &fx.config, &AgeTool, &key, &fx.alice);
    assert!(result.is_err());
    assert_eq!(fx.state.temp_path(IDENTITY_FILE_TEMP).unwrap(), None);
    assert_eq!(fx.state.temp_path(SSH_CONFIG_TEMP).unwrap(), None);

    let reopened = ArchiveState::open(&fx.layout.state_file()).unwrap();
    assert_eq!(reopened.temp_path(IDENTITY_FILE_TEMP).unwrap(), None);

    key.release(&mut fx.state).unwrap();
}

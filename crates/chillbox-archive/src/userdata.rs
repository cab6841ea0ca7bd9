//! Server user-data scripts (`server/{name}/user-data`).
//!
//! User-data is plaintext, so its context never includes secrets.

use std::collections::BTreeSet;

use chillbox_core::config::{ChillboxConfig, Context, Server};
use chillbox_core::{ArchiveLayout, ChillboxError, ChillboxResult, Identity};
use serde_json::{json, Value};

use crate::render::{merge_contexts, Renderer};

/// Authorized keys for each of the server's login users.
///
/// The current operator's chillbox ssh key is added to their own entry.
fn login_users(
    config: &ChillboxConfig,
    server: &Server,
    identity: &Identity,
    operator_keys: &[String],
) -> Vec<(String, Vec<String>)> {
    server
        .login_users
        .iter()
        .map(|name| {
            let mut keys: Vec<String> = config
                .user(name)
                .map(|u| u.public_ssh_keys.clone())
                .unwrap_or_else(|| {
                    tracing::warn!(server = %server.name, user = %name, "login user is not a configured user");
                    Vec::new()
                });
            if *name == identity.name {
                for key in operator_keys {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }
            (name.clone(), keys)
        })
        .collect()
}

pub fn user_data_context(
    config: &ChillboxConfig,
    server: &Server,
    identity: &Identity,
    operator_keys: &[String],
) -> Context {
    let users = login_users(config, server, identity, operator_keys);
    let public_ssh_keys: BTreeSet<&String> = users.iter().flat_map(|(_, keys)| keys).collect();

    let mut base = Context::new();
    base.insert("public_ssh_keys".into(), json!(public_ssh_keys));
    base.insert("hostname".into(), Value::String(server.host.clone()));
    base.insert(
        "login_users".into(),
        Value::Array(
            users
                .iter()
                .map(|(name, keys)| {
                    json!({
                        "name": name,
                        "public_ssh_keys": keys,
                        "password_hash": config.user(name).and_then(|u| u.password_hash.clone()),
                    })
                })
                .collect(),
        ),
    );
    base.insert("no_home_users".into(), json!(server.no_home_users));

    let env: Context = config
        .env
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let user_data = server
        .user_data
        .as_ref()
        .map(|ud| ud.context.clone())
        .unwrap_or_default();
    merge_contexts([&base, &env, &user_data])
}

/// Render and write user-data for every server that defines it. Returns the
/// names of the servers written.
pub fn generate_server_user_data(
    layout: &ArchiveLayout,
    config: &ChillboxConfig,
    renderer: &dyn Renderer,
    identity: &Identity,
    operator_keys: &[String],
) -> ChillboxResult<Vec<String>> {
    let mut written = Vec::new();
    for server in &config.servers {
        let Some(user_data) = &server.user_data else {
            continue;
        };

        let context = user_data_context(config, server, identity, operator_keys);
        let text = renderer.render(&user_data.template, &context)?;
        if let Some(limit) = user_data.file_size_limit {
            if text.len() >= limit {
                tracing::info!(server = %server.name, "{text}");
                return Err(ChillboxError::ServerUserData(format!(
                    "the rendered server ({}) user-data is over the file size limit. \
                     Limit is {limit} and user-data bytes is {}.",
                    server.name,
                    text.len()
                )));
            }
        }

        std::fs::create_dir_all(layout.server_dir(&server.name))?;
        std::fs::write(layout.server_user_data(&server.name), &text)?;

        let keys: BTreeSet<String> = login_users(config, server, identity, operator_keys)
            .into_iter()
            .flat_map(|(_, keys)| keys)
            .collect();
        let mut authorized = keys.into_iter().collect::<Vec<_>>().join("\n");
        if !authorized.is_empty() {
            authorized.push('\n');
        }
        std::fs::write(layout.server_public_ssh_key(&server.name), authorized)?;

        tracing::info!(server = %server.name, bytes = text.len(), "wrote server user-data");
        written.push(server.name.clone());
    }
    Ok(written)
}

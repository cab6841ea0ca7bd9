//! Template rendering through minijinja.
//!
//! Template names take the form `prefix:path`. Each configured prefix maps to
//! a directory inside the working directory; the built-in `chillbox` prefix
//! carries the default server templates. Resolved files must stay inside
//! both their template directory and the working directory after symlinks
//! are followed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chillbox_core::config::{Context, TemplateSource};
use chillbox_core::{ChillboxError, ChillboxResult};
use minijinja::{Environment, ErrorKind};

pub const BUILTIN_PREFIX: &str = "chillbox";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[(
    "user-data.sh.jinja",
    include_str!("../templates/user-data.sh.jinja"),
)];

/// Renders template references with a context map.
pub trait Renderer {
    fn render(&self, template: &str, context: &Context) -> ChillboxResult<String>;

    /// Render a plain file inside the working directory.
    fn render_file(&self, path: &Path, context: &Context) -> ChillboxResult<String>;
}

#[derive(Debug)]
struct Sources {
    working_directory: PathBuf,
    prefixes: BTreeMap<String, PathBuf>,
}

enum Resolved {
    Builtin(&'static str),
    File(PathBuf),
}

impl Sources {
    fn resolve(&self, name: &str) -> ChillboxResult<Option<Resolved>> {
        let Some((prefix, rest)) = name.split_once(':') else {
            return Ok(None);
        };

        if let Some(dir) = self.prefixes.get(prefix) {
            let candidate = dir.join(rest);
            let Ok(resolved) = std::fs::canonicalize(&candidate) else {
                return Ok(None);
            };
            if !resolved.starts_with(dir) || !resolved.starts_with(&self.working_directory) {
                return Err(ChillboxError::InvalidConfig(format!(
                    "the template '{name}' resolves to {}, outside of {}",
                    resolved.display(),
                    dir.display()
                )));
            }
            return Ok(resolved.is_file().then_some(Resolved::File(resolved)));
        }

        if prefix == BUILTIN_PREFIX {
            return Ok(BUILTIN_TEMPLATES
                .iter()
                .find(|(n, _)| *n == rest)
                .map(|(_, source)| Resolved::Builtin(source)));
        }
        Ok(None)
    }

    fn load(&self, name: &str) -> ChillboxResult<Option<String>> {
        match self.resolve(name)? {
            Some(Resolved::Builtin(source)) => Ok(Some(source.to_string())),
            Some(Resolved::File(path)) => Ok(Some(std::fs::read_to_string(path)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (prefix, dir) in &self.prefixes {
            let mut files = Vec::new();
            collect_files(dir, dir, &mut files);
            names.extend(files.into_iter().map(|f| format!("{prefix}:{f}")));
        }
        if !self.prefixes.contains_key(BUILTIN_PREFIX) {
            names.extend(
                BUILTIN_TEMPLATES
                    .iter()
                    .map(|(n, _)| format!("{BUILTIN_PREFIX}:{n}")),
            );
        }
        names.sort();
        names
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
}

pub struct TemplateRenderer {
    env: Environment<'static>,
    sources: Arc<Sources>,
}

impl TemplateRenderer {
    /// `templates` come from validated config, so their directories are
    /// already canonical and inside the working directory.
    pub fn new(templates: &[TemplateSource], working_directory: &Path) -> Self {
        let sources = Arc::new(Sources {
            working_directory: working_directory.to_path_buf(),
            prefixes: templates
                .iter()
                .map(|t| (t.prefix.clone(), t.dir.clone()))
                .collect(),
        });

        let mut env = Environment::new();
        let loader_sources = Arc::clone(&sources);
        env.set_loader(move |name| {
            loader_sources
                .load(name)
                .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))
        });

        Self { env, sources }
    }

    pub fn available_templates(&self) -> Vec<String> {
        self.sources.list()
    }

    fn missing(&self, template: &str) -> ChillboxError {
        let available = self
            .available_templates()
            .iter()
            .map(|t| format!("\n    - {t}"))
            .collect::<String>();
        ChillboxError::MissingFile(format!(
            "the template ({template}) is not an available template in the list:{available}"
        ))
    }

    fn translate(&self, template: &str, err: minijinja::Error) -> ChillboxError {
        match err.kind() {
            ErrorKind::TemplateNotFound => self.missing(template),
            _ => ChillboxError::Other(anyhow::anyhow!("failed to render {template}: {err:#}")),
        }
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, template: &str, context: &Context) -> ChillboxResult<String> {
        // escapes are configuration errors, not missing templates
        if self.sources.resolve(template)?.is_none() {
            return Err(self.missing(template));
        }
        let tmpl = self
            .env
            .get_template(template)
            .map_err(|e| self.translate(template, e))?;
        let text = tmpl.render(context).map_err(|e| self.translate(template, e))?;
        tracing::debug!(template = %template, bytes = text.len(), "rendered template");
        Ok(text)
    }

    fn render_file(&self, path: &Path, context: &Context) -> ChillboxResult<String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| ChillboxError::MissingFile(format!("{}: {e}", path.display())))?;
        let name = path.to_string_lossy();
        self.env
            .render_named_str(&name, &source, context)
            .map_err(|e| self.translate(&name, e))
    }
}

/// Merge template contexts; later maps win on key conflicts.
pub fn merge_contexts<'a>(layers: impl IntoIterator<Item = &'a Context>) -> Context {
    let mut merged = Context::new();
    for layer in layers {
        for (k, v) in layer {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, PathBuf, TemplateRenderer) {
        let dir = tempfile::tempdir().unwrap();
        let wd = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(wd.join("templates/partials")).unwrap();
        std::fs::write(wd.join("templates/site.conf.j2"), "port={{ PORT }}\n").unwrap();
        std::fs::write(
            wd.join("templates/nested.j2"),
            "{% include 'site1:partials/head.j2' %}",
        )
        .unwrap();
        std::fs::write(wd.join("templates/partials/head.j2"), "head {{ DOMAIN }}").unwrap();
        let renderer = TemplateRenderer::new(
            &[TemplateSource {
                prefix: "site1".into(),
                dir: wd.join("templates"),
            }],
            &wd,
        );
        (dir, wd, renderer)
    }

    fn ctx(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn renders_prefixed_template() {
        let (_dir, _wd, renderer) = setup();
        let text = renderer
            .render("site1:site.conf.j2", &ctx(json!({"PORT": "8080"})))
            .unwrap();
        assert_eq!(text, "port=8080");
    }

    #[test]
    fn renders_includes_through_the_loader() {
        let (_dir, _wd, renderer) = setup();
        let text = renderer
            .render("site1:nested.j2", &ctx(json!({"DOMAIN": "example.test"})))
            .unwrap();
        assert_eq!(text, "head example.test");
    }

    #[test]
    fn missing_template_lists_available() {
        let (_dir, _wd, renderer) = setup();
        let err = renderer.render("site1:nope.j2", &Context::new()).unwrap_err();
        match err {
            ChillboxError::MissingFile(msg) => {
                assert!(msg.contains("site1:site.conf.j2"));
                assert!(msg.contains("chillbox:user-data.sh.jinja"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn symlink_escape_is_a_config_error() {
        let (_dir, wd, renderer) = setup();
        let outside = tempfile::NamedTempFile::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), wd.join("templates/escape.j2")).unwrap();
        let err = renderer.render("site1:escape.j2", &Context::new()).unwrap_err();
        assert!(matches!(err, ChillboxError::InvalidConfig(_)));
    }

    #[test]
    fn builtin_user_data_template() {
        let (_dir, _wd, renderer) = setup();
        let text = renderer
            .render(
                "chillbox:user-data.sh.jinja",
                &ctx(json!({
                    "hostname": "web1",
                    "login_users": [{"name": "alice", "public_ssh_keys": ["ssh-ed25519 AAAA alice"]}],
                    "no_home_users": [],
                })),
            )
            .unwrap();
        assert!(text.contains("adduser -D -s /bin/sh alice"));
        assert!(text.contains("ssh-ed25519 AAAA alice"));
    }

    #[test]
    fn later_context_layers_win() {
        let env = ctx(json!({"PORT": "80", "DOMAIN": "example.test"}));
        let entry = ctx(json!({"PORT": "8080"}));
        let merged = merge_contexts([&env, &entry]);
        assert_eq!(merged["PORT"], json!("8080"));
        assert_eq!(merged["DOMAIN"], json!("example.test"));
    }
}

//! Filtered credentials for the sandbox.
//!
//! Only allow-listed keys ever reach the sandbox. Values come from the
//! project's `.env` file first and the host environment second, and are
//! held as secrets until written to the group's env directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use tokio::fs;

/// File name of the credentials file inside the env directory.
pub const ENV_FILE: &str = "env";

/// Allow-listed credentials resolved for one run.
#[derive(Debug, Default)]
pub struct Credentials {
    values: BTreeMap<String, SecretString>,
}

impl Credentials {
    /// Resolve `keys` from `dotenv` contents, falling back to the process environment.
    pub fn resolve(keys: &[String], dotenv: Option<&str>) -> Self {
        let from_file = dotenv.map(parse_dotenv).unwrap_or_default();
        let mut values = BTreeMap::new();
        for key in keys {
            let value = from_file
                .get(key.as_str())
                .cloned()
                .or_else(|| std::env::var(key).ok())
                .filter(|v| !v.is_empty());
            if let Some(value) = value {
                values.insert(key.clone(), SecretString::from(value));
            }
        }
        Self { values }
    }

    /// Read `<project_root>/.env` (if present) and resolve `keys`.
    pub async fn load(project_root: &Path, keys: &[String]) -> std::io::Result<Self> {
        let dotenv = match fs::read_to_string(project_root.join(".env")).await {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        Ok(Self::resolve(keys, dotenv.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Key names present, for logging.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Write `KEY=value` lines to `<env_dir>/env`, replacing any previous file.
    pub async fn write_to(&self, env_dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(env_dir).await?;
        let mut body = String::new();
        for (key, value) in &self.values {
            body.push_str(key);
            body.push('=');
            body.push_str(value.expose_secret());
            body.push('\n');
        }
        let path = env_dir.join(ENV_FILE);
        fs::write(&path, body).await?;
        restrict_permissions(&path).await?;
        Ok(path)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Parse `KEY=value` lines. Comments, blank lines and `export ` prefixes are
/// handled; matching single or double quotes around the value are stripped.
fn parse_dotenv(raw: &str) -> BTreeMap<&str, String> {
    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = ['"', '\'']
            .iter()
            .find_map(|q| {
                value
                    .strip_prefix(*q)
                    .and_then(|v| v.strip_suffix(*q))
            })
            .unwrap_or(value);
        out.insert(key.trim(), value.to_string());
    }
    out
}

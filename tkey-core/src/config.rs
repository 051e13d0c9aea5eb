//! The JSON configuration file.
//!
//! ```json
//! {
//!   "04a1b2…": {
//!     "rpURL": "https://ssh.trustedkey.com",
//!     "clientId": "…",
//!     "clientSecret": "…"
//!   },
//!   "config": { "proxy": "/run/user/1000/ssh-agent.sock" }
//! }
//! ```
//!
//! Every top-level key except `"config"` is the hex SEC1 public key of an
//! identity.  Identity order is file order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::ConfigError;
use crate::identity::RemoteIdentity;

/// Reserved top-level key for process-wide settings.
pub const SETTINGS_KEY: &str = "config";

/// File name under `$XDG_CONFIG_HOME` (or `~/.config`).
pub const CONFIG_FILE_NAME: &str = "tk-ssh.json";

#[derive(Debug, Default)]
pub struct Config {
    pub identities: Vec<IdentityRecord>,
    pub settings: Settings,
}

/// One identity entry, as stored.
pub struct IdentityRecord {
    pub public_key: String,
    pub rp_url: String,
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
}

impl std::fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("public_key", &self.public_key)
            .field("rp_url", &self.rp_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Socket path of the agent that unknown keys are forwarded to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

#[derive(Deserialize)]
struct RawIdentity {
    #[serde(rename = "rpURL")]
    rp_url: Option<String>,
    #[serde(rename = "clientId")]
    client_id: Option<String>,
    #[serde(rename = "clientSecret")]
    client_secret: Option<String>,
}

impl Config {
    /// Resolve every record into a [`RemoteIdentity`], failing on the first
    /// key that cannot be turned into an address.
    pub fn remote_identities(&self) -> Result<Vec<RemoteIdentity>, ConfigError> {
        self.identities
            .iter()
            .map(RemoteIdentity::from_record)
            .collect()
    }
}

/// Parse configuration from a JSON string.
pub fn parse(json: &str) -> Result<Config, ConfigError> {
    let root: Map<String, Value> = serde_json::from_str(json)?;
    let mut config = Config::default();

    for (key, value) in root {
        if key == SETTINGS_KEY {
            config.settings = serde_json::from_value(value)?;
            continue;
        }
        if !value.is_object() {
            return Err(ConfigError::NotAnObject(key));
        }
        let raw: RawIdentity = serde_json::from_value(value)?;
        let missing = |field| ConfigError::MissingField {
            key: key.clone(),
            field,
        };
        let rp_url = raw.rp_url.ok_or_else(|| missing("rpURL"))?;
        let client_id = raw.client_id.ok_or_else(|| missing("clientId"))?;
        let client_secret = raw.client_secret.ok_or_else(|| missing("clientSecret"))?;

        config.identities.push(IdentityRecord {
            public_key: key,
            rp_url,
            client_id,
            client_secret: Zeroizing::new(client_secret),
        });
    }

    Ok(config)
}

/// Load the configuration file.
///
/// A missing file is not an error: it yields an empty configuration so the
/// agent can still run as a pure proxy.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, no remote identities loaded");
        return Ok(Config::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata(path)
            && meta.mode() & 0o077 != 0
        {
            warn!(
                path = %path.display(),
                mode = format!("{:o}", meta.mode() & 0o777),
                "config file is readable by group or others, recommend: chmod 600 {}",
                path.display()
            );
        }
    }

    let contents = std::fs::read_to_string(path)?;
    let config = parse(&contents)?;
    debug!(
        path = %path.display(),
        identities = config.identities.len(),
        "config loaded"
    );
    Ok(config)
}

/// Set or clear the default proxy backend, leaving identity entries untouched.
pub fn save_proxy(path: &Path, proxy: Option<&str>) -> Result<(), ConfigError> {
    let mut root: Map<String, Value> = if path.exists() {
        serde_json::from_str(&std::fs::read_to_string(path)?)?
    } else {
        Map::new()
    };

    let settings = root
        .entry(SETTINGS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(settings) = settings.as_object_mut() else {
        return Err(ConfigError::NotAnObject(SETTINGS_KEY.to_string()));
    };
    match proxy {
        Some(proxy) if !proxy.is_empty() => {
            settings.insert("proxy".to_string(), Value::String(proxy.to_string()));
        }
        _ => {
            settings.remove("proxy");
        }
    }

    write_private(path, &serde_json::to_vec_pretty(&root)?)
}

/// Default config path: `$XDG_CONFIG_HOME/tk-ssh.json`, else `~/.config/tk-ssh.json`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join(CONFIG_FILE_NAME)
}

fn write_private(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write as _;
        use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(contents)?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, contents)?;

    Ok(())
}

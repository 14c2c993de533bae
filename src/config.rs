use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TENANT_VIEWER_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address, e.g. 0.0.0.0:8080
    pub bind: String,
    /// Authentication endpoint consulted for WebSocket upgrades.
    pub auth_url: Option<String>,
    pub request_timeout_secs: u64,
    /// Tenants with a backend. Empty accepts any tenant.
    pub tenants: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            auth_url: None,
            request_timeout_secs: 30,
            tenants: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn expand(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.bind = expand_vars(&self.bind, &lookup);
        if let Some(url) = self.auth_url.as_mut() {
            *url = expand_vars(url, &lookup);
        }
        self.tenants = self
            .tenants
            .into_iter()
            .map(|t| expand_vars(&t, &lookup))
            .collect();
        self
    }
}

/// Locate the config file: `$TENANT_VIEWER_CONFIG`, then
/// `$XDG_CONFIG_HOME/tenant-viewer/config.json`, then `./tenant-viewer.json`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var(CONFIG_ENV) {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("tenant-viewer").join("config.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("tenant-viewer.json");
    candidate.exists().then_some(candidate)
}

/// Load the config from the resolved path, or defaults when there is none.
pub fn load_config() -> anyhow::Result<GatewayConfig> {
    match resolve_config_path() {
        Some(path) => load_config_from(&path),
        None => Ok(GatewayConfig::default()),
    }
}

pub fn load_config_from(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let cfg: GatewayConfig = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
    Ok(cfg.expand(|name| env::var(name).ok()))
}

/// Replace `${NAME}` with `lookup(NAME)`. Unknown names are left as written.
fn expand_vars(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match lookup(&name) {
                Some(val) => out.push_str(&val),
                None => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

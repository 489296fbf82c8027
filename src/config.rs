use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};

const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 2;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaestroConfig {
    /// Root directory holding one source directory per image.
    pub internal_dir: PathBuf,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Timeout handed to the runtime client for each API request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// How to reach one remote host's Podman socket.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub username: Option<String>,
    /// SSH host. When absent the socket is treated as local.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub podman_socket: String,
    #[serde(default)]
    pub identity_file: Option<String>,
}

impl ServerConfig {
    /// `user@host` (or just `host`) for use as an ssh destination.
    pub fn ssh_destination(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match self.username.as_deref() {
            Some(user) if !user.is_empty() => format!("{user}@{host}"),
            _ => host.to_string(),
        })
    }

    /// Human-readable address, never including credentials.
    pub fn address(&self) -> String {
        match self.ssh_destination() {
            Some(dest) => format!("ssh://{}{}", dest, self.podman_socket),
            None => format!("unix://{}", self.podman_socket),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl MaestroConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: MaestroConfig = serde_json::from_str(raw)?;
        cfg.expanded(|name| env::var(name).ok()).validated()
    }

    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p,
            None => resolve_config_path()?,
        };
        let raw = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&raw)
    }

    fn expanded(mut self, lookup: impl Fn(&str) -> Option<String> + Copy) -> Self {
        self.internal_dir = PathBuf::from(expand_env_vars(
            &self.internal_dir.to_string_lossy(),
            lookup,
        ));

        for server in self.servers.values_mut() {
            for field in [&mut server.username, &mut server.host, &mut server.identity_file]
                .into_iter()
                .flatten()
            {
                *field = expand_env_vars(field, lookup);
            }
            server.podman_socket = expand_env_vars(&server.podman_socket, lookup);
        }

        self
    }

    fn validated(self) -> anyhow::Result<Self> {
        for (name, server) in &self.servers {
            if name.is_empty() {
                return Err(anyhow::anyhow!("Server names must not be empty"));
            }
            if !server.podman_socket.starts_with('/') {
                return Err(anyhow::anyhow!(
                    "Server `{}` must have an absolute `podmanSocket` path",
                    name
                ));
            }
            if matches!(server.host.as_deref(), Some("")) {
                return Err(anyhow::anyhow!("Server `{}` has an empty `host`", name));
            }
        }
        Ok(self)
    }
}

pub fn resolve_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(p) = env::var("MAESTRO_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("maestro").join("maestro.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("maestro.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find maestro.json (set MAESTRO_CONFIG or create ./maestro.json)"
    ))
}

/// Replace `${NAME}` occurrences using `lookup`; unknown names are left as-is.
fn expand_env_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
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

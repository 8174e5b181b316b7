//! Registry credential discovery.
//!
//! Credentials come from the standard docker config
//! (`$DOCKER_CONFIG/config.json` or `~/.docker/config.json`), with the
//! usual aliasing for Docker Hub's legacy index key. Explicit per-flavor
//! overrides are handled by the adapters themselves.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine as _;
use serde::Deserialize;

use stagehand_core::error::{Error, Result};

/// Username/password pair for a registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// The account name.
    pub username: String,
    /// The account password or token.
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerAuthEntry {
    fn credentials(&self) -> Result<Option<RegistryCredentials>> {
        if let Some(auth) = &self.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth)
                .map_err(|e| Error::Config {
                    message: format!("invalid base64 in docker config auth: {e}"),
                })?;
            let decoded = String::from_utf8(decoded).map_err(|e| Error::Config {
                message: format!("docker config auth is not utf-8: {e}"),
            })?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| Error::Config {
                message: "docker config auth is not user:password".into(),
            })?;
            return Ok(Some(RegistryCredentials {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(Some(RegistryCredentials {
                username: username.clone(),
                password: password.clone(),
            }));
        }
        Ok(None)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

/// Looks up credentials for `host` in the docker config.
///
/// Returns `None` when no config exists or no entry matches; anonymous
/// access is normal for public registries.
///
/// # Errors
///
/// Returns [`Error::Config`] when the config file exists but cannot be
/// parsed.
pub fn resolve_credentials(host: &str) -> Result<Option<RegistryCredentials>> {
    let Some(path) = config_path() else {
        return Ok(None);
    };
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Config {
                message: format!("read {}: {e}", path.display()),
            });
        }
    };
    let config: DockerConfig = serde_json::from_str(&data).map_err(|e| Error::Config {
        message: format!("parse {}: {e}", path.display()),
    })?;
    lookup(&config, host)
}

fn lookup(config: &DockerConfig, host: &str) -> Result<Option<RegistryCredentials>> {
    let mut keys = vec![
        host.to_string(),
        format!("https://{host}"),
        format!("http://{host}"),
    ];
    if host == "docker.io" || host == "index.docker.io" || host == "registry-1.docker.io" {
        keys.push("https://index.docker.io/v1/".to_string());
        keys.push("index.docker.io".to_string());
    }

    for key in keys {
        if let Some(entry) = config.auths.get(&key) {
            if let Some(credentials) = entry.credentials()? {
                return Ok(Some(credentials));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> DockerConfig {
        serde_json::from_str(json).expect("config")
    }

    #[test]
    fn test_lookup_base64_auth() {
        let config = parse(
            r#"{"auths": {"registry.local": {"auth": "dXNlcjpzZWNyZXQ="}}}"#,
        );
        let credentials = lookup(&config, "registry.local")
            .expect("lookup")
            .expect("credentials");
        assert_eq!(credentials.username, "user");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn test_lookup_plain_fields() {
        let config = parse(
            r#"{"auths": {"registry.local": {"username": "u", "password": "p"}}}"#,
        );
        let credentials = lookup(&config, "registry.local")
            .expect("lookup")
            .expect("credentials");
        assert_eq!(credentials.username, "u");
    }

    #[test]
    fn test_docker_io_aliases_to_index_key() {
        let config = parse(
            r#"{"auths": {"https://index.docker.io/v1/": {"auth": "dXNlcjpzZWNyZXQ="}}}"#,
        );
        assert!(lookup(&config, "docker.io").expect("lookup").is_some());
        assert!(lookup(&config, "quay.io").expect("lookup").is_none());
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        let config = parse(r#"{"auths": {"registry.local": {"auth": "!!!"}}}"#);
        assert!(lookup(&config, "registry.local").is_err());
    }
}

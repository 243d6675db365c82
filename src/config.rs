//! Run configuration.
//!
//! STUN servers can come from three places; precedence is CLI flags, then an
//! optional TOML config file, then the built-in defaults.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Fixed local session credentials for a long-running accept side.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub fragment: String,
    pub secret: String,
}

/// Connectivity-agent configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// STUN servers for server-reflexive candidate discovery (`host:port`).
    pub stun_servers: Vec<String>,
    /// Pinned local credentials; random per run when absent.
    pub local_credentials: Option<Credentials>,
}

/// TOML config file contents.
///
/// ```toml
/// [agent]
/// stun_servers = ["stun.example.net:3478"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSection {
    pub stun_servers: Option<Vec<String>>,
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Default public STUN servers.
pub fn default_stun_servers() -> Vec<String> {
    vec![
        "stun.l.google.com:19302".to_string(),
        "stun1.l.google.com:19302".to_string(),
    ]
}

// CLI list wins; config list next (even if empty, which disables STUN);
// defaults otherwise.
pub fn resolve_stun_servers(
    cli_stun_servers: &[String],
    config_stun_servers: Option<Vec<String>>,
) -> Vec<String> {
    if !cli_stun_servers.is_empty() {
        return cli_stun_servers.to_vec();
    }
    if let Some(servers) = config_stun_servers {
        return servers;
    }
    default_stun_servers()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_stun_precedence() {
        let cli = vec!["stun.example.net:3478".to_string()];
        let file = Some(vec!["stun.other.net:3478".to_string()]);

        assert_eq!(resolve_stun_servers(&cli, file.clone()), cli);
        assert_eq!(
            resolve_stun_servers(&[], file.clone()),
            vec!["stun.other.net:3478".to_string()]
        );
        // An explicitly empty config list disables STUN.
        assert!(resolve_stun_servers(&[], Some(Vec::new())).is_empty());
        assert_eq!(resolve_stun_servers(&[], None), default_stun_servers());
    }

    #[test]
    fn test_load_file_config() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[agent]\nstun_servers = [\"stun.example.net:3478\"]")
            .expect("write config");

        let config = load_file_config(file.path()).expect("load config");
        assert_eq!(
            config.agent.stun_servers,
            Some(vec!["stun.example.net:3478".to_string()])
        );
    }

    #[test]
    fn test_load_file_config_empty_is_default() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let config = load_file_config(file.path()).expect("load config");
        assert!(config.agent.stun_servers.is_none());
    }
}

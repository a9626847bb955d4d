//! Daemon configuration: an optional TOML file overlaid by CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pairsync_core::Identity;
use pairsync_link::{LinkConfig, Role, Timings};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid identity: {0}")]
    Identity(#[from] pairsync_core::IdentityParseError),
    #[error("no workspace given; pass --workspace or set `workspace` in the config file")]
    MissingWorkspace,
}

/// Everything the config file may set. All keys are optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub role: Option<Role>,
    pub identity: Option<String>,
    pub workspace: Option<String>,
    pub discovery_port: Option<u16>,
    pub bind_host: Option<String>,
    pub auto_reconnect: Option<bool>,
    pub store_path: Option<PathBuf>,
    /// Argument template run to open a file, e.g. `code --goto {path}:{line}:{column}`.
    pub open_command: Option<String>,
    /// Argument templates tried in order to raise a window.
    #[serde(default)]
    pub focus_commands: Vec<String>,
    #[serde(default)]
    pub timings: TimingsConfig,
}

/// `[timings]` table, in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingsConfig {
    pub hello_timeout: Option<u64>,
    pub discovery_grace: Option<u64>,
    pub pending_ttl: Option<u64>,
    pub reconnect_delay: Option<u64>,
    pub discovery_retry: Option<u64>,
    pub error_backoff: Option<u64>,
    pub connect_timeout: Option<u64>,
}

impl TimingsConfig {
    fn apply(&self, timings: &mut Timings) {
        let set = |slot: &mut Duration, ms: Option<u64>| {
            if let Some(ms) = ms {
                *slot = Duration::from_millis(ms);
            }
        };
        set(&mut timings.hello_timeout, self.hello_timeout);
        set(&mut timings.discovery_grace, self.discovery_grace);
        set(&mut timings.pending_ttl, self.pending_ttl);
        set(&mut timings.reconnect_delay, self.reconnect_delay);
        set(&mut timings.discovery_retry, self.discovery_retry);
        set(&mut timings.error_backoff, self.error_backoff);
        set(&mut timings.connect_timeout, self.connect_timeout);
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Flag values that override the file. `None` means "not given".
#[derive(Debug, Default)]
pub struct Overrides {
    pub role: Option<Role>,
    pub identity: Option<String>,
    pub workspace: Option<String>,
    pub discovery_port: Option<u16>,
    pub bind_host: Option<String>,
    pub no_auto_reconnect: bool,
    pub store_path: Option<PathBuf>,
    pub open_command: Option<String>,
}

/// Fully resolved daemon settings.
#[derive(Debug)]
pub struct Settings {
    pub link: LinkConfig,
    pub store_path: Option<PathBuf>,
    pub open_command: Option<String>,
    pub focus_commands: Vec<String>,
}

impl Settings {
    pub fn resolve(file: FileConfig, flags: Overrides) -> Result<Self, ConfigError> {
        let role = flags.role.or(file.role).unwrap_or(Role::Host);
        let workspace = flags
            .workspace
            .or(file.workspace)
            .ok_or(ConfigError::MissingWorkspace)?;

        let mut link = LinkConfig::new(role, workspace);
        if let Some(identity) = flags.identity.or(file.identity) {
            link.identity = identity.parse::<Identity>()?;
        }
        if let Some(port) = flags.discovery_port.or(file.discovery_port) {
            link.discovery_port = port;
        }
        if let Some(host) = flags.bind_host.or(file.bind_host) {
            link.bind_host = host;
        }
        link.auto_reconnect = !flags.no_auto_reconnect && file.auto_reconnect.unwrap_or(true);
        file.timings.apply(&mut link.timings);

        Ok(Self {
            link,
            store_path: flags.store_path.or(file.store_path),
            open_command: flags.open_command.or(file.open_command),
            focus_commands: file.focus_commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> FileConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn file_values_apply() {
        let file = parse(
            r#"
            role = "peer"
            identity = "jetbrains"
            workspace = "/home/me/proj"
            discovery_port = 4000
            auto_reconnect = false
            open_command = "idea --line {line} {path}"
            focus_commands = ["wmctrl -a {workspace}", "xdotool search --name {workspace} windowactivate"]

            [timings]
            error_backoff = 2500
            "#,
        );
        let settings = Settings::resolve(file, Overrides::default()).unwrap();

        assert_eq!(settings.link.role, Role::Peer);
        assert_eq!(settings.link.identity.as_str(), "jetbrains");
        assert_eq!(settings.link.workspace, "/home/me/proj");
        assert_eq!(settings.link.discovery_port, 4000);
        assert_eq!(settings.link.session_port_floor(), 4001);
        assert!(!settings.link.auto_reconnect);
        assert_eq!(settings.link.timings.error_backoff, Duration::from_millis(2500));
        assert_eq!(settings.link.timings.hello_timeout, Duration::from_secs(5));
        assert_eq!(settings.focus_commands.len(), 2);
    }

    #[test]
    fn flags_win_over_file() {
        let file = parse(
            r#"
            role = "peer"
            workspace = "/from/file"
            discovery_port = 4000
            "#,
        );
        let flags = Overrides {
            role: Some(Role::Host),
            workspace: Some("/from/flag".to_string()),
            discovery_port: Some(5000),
            no_auto_reconnect: true,
            ..Overrides::default()
        };
        let settings = Settings::resolve(file, flags).unwrap();

        assert_eq!(settings.link.role, Role::Host);
        assert_eq!(settings.link.identity.as_str(), "host");
        assert_eq!(settings.link.workspace, "/from/flag");
        assert_eq!(settings.link.discovery_port, 5000);
        assert!(!settings.link.auto_reconnect);
    }

    #[test]
    fn defaults_need_only_a_workspace() {
        let flags = Overrides {
            workspace: Some("/proj".to_string()),
            ..Overrides::default()
        };
        let settings = Settings::resolve(FileConfig::default(), flags).unwrap();
        assert_eq!(settings.link.role, Role::Host);
        assert_eq!(settings.link.discovery_port, 3000);
        assert_eq!(settings.link.bind_host, "127.0.0.1");
        assert!(settings.link.auto_reconnect);
        assert!(settings.store_path.is_none());
    }

    #[test]
    fn missing_workspace_is_an_error() {
        let err = Settings::resolve(FileConfig::default(), Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingWorkspace));
    }

    #[test]
    fn bad_identity_is_rejected() {
        let file = parse(
            r#"
            workspace = "/proj"
            identity = "two words"
            "#,
        );
        let err = Settings::resolve(file, Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Identity(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("prot = 3000").is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairsync.toml");
        std::fs::write(&path, "workspace = \"/proj\"\n").unwrap();
        assert_eq!(FileConfig::load(&path).unwrap().workspace.as_deref(), Some("/proj"));

        let missing = dir.path().join("nope.toml");
        let err = FileConfig::load(&missing).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }
}

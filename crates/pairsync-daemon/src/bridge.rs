//! Command-template implementations of the editor and focus capabilities.
//!
//! Templates are split on whitespace into a program and its arguments before
//! placeholders are filled in, so substituted paths are never re-parsed by a
//! shell.

use std::path::Path;
use std::process::{Command, Stdio};

use pairsync_link::{BridgeError, EditorBridge, FocusHint, WindowFocuser};
use tracing::{debug, info, warn};

/// Split `template` and replace `{name}` placeholders in every word.
fn render(template: &str, vars: &[(&str, &str)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|word| {
            vars.iter().fold(word.to_string(), |word, (name, value)| {
                word.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

fn spawn_detached(argv: &[String]) -> std::io::Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::ErrorKind::InvalidInput.into());
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    // Reap the editor launcher without blocking the caller.
    std::thread::spawn(move || child.wait());
    Ok(())
}

/// Opens files by running `open_command`, or only logs when none is set.
pub struct CommandBridge {
    template: Option<String>,
}

impl CommandBridge {
    pub fn new(template: Option<String>) -> Self {
        Self { template }
    }
}

impl EditorBridge for CommandBridge {
    fn open_file_at(&self, path: &Path, line: u32, column: u32) -> Result<(), BridgeError> {
        if !path.exists() {
            return Err(BridgeError::Unresolved {
                path: path.display().to_string(),
                reason: "no such file".to_string(),
            });
        }

        let Some(template) = &self.template else {
            info!(path = %path.display(), line, column, "remote selection");
            return Ok(());
        };

        let (path, line, column) = (path.display().to_string(), line.to_string(), column.to_string());
        let argv = render(
            template,
            &[
                ("path", path.as_str()),
                ("line", line.as_str()),
                ("column", column.as_str()),
            ],
        );
        debug!(?argv, "running open command");
        spawn_detached(&argv).map_err(|e| BridgeError::Rejected(format!("{template}: {e}")))
    }
}

/// Raises a window by running one command and checking its exit status.
pub struct CommandFocuser {
    template: String,
}

impl CommandFocuser {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl WindowFocuser for CommandFocuser {
    fn name(&self) -> &str {
        &self.template
    }

    fn try_focus(&self, hint: &FocusHint) -> bool {
        let workspace = hint.workspace.as_deref().unwrap_or_default();
        let argv = render(&self.template, &[("workspace", workspace)]);
        let Some((program, args)) = argv.split_first() else {
            return false;
        };
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(command = %self.template, error = %e, "focus command failed to start");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairsync_link::FocusReason;

    #[test]
    fn placeholders_fill_each_word() {
        let argv = render(
            "code --goto {path}:{line}:{column}",
            &[("path", "/a b.rs"), ("line", "3"), ("column", "9")],
        );
        assert_eq!(argv, vec!["code", "--goto", "/a b.rs:3:9"]);
    }

    #[test]
    fn unknown_placeholders_stay() {
        let argv = render("open {nope}", &[("path", "/x")]);
        assert_eq!(argv, vec!["open", "{nope}"]);
    }

    #[test]
    fn missing_file_is_unresolved() {
        let bridge = CommandBridge::new(None);
        let err = bridge
            .open_file_at(Path::new("/definitely/not/here.rs"), 1, 1)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unresolved { .. }));
    }

    #[test]
    fn existing_file_without_command_is_accepted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let bridge = CommandBridge::new(None);
        assert!(bridge.open_file_at(file.path(), 4, 2).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn focus_reports_exit_status() {
        let hint = FocusHint {
            reason: FocusReason::PeerRequested,
            workspace: Some("/proj".to_string()),
        };
        assert!(CommandFocuser::new("true {workspace}").try_focus(&hint));
        assert!(!CommandFocuser::new("false").try_focus(&hint));
        assert!(!CommandFocuser::new("pairsync-no-such-binary").try_focus(&hint));
        assert!(!CommandFocuser::new("").try_focus(&hint));
    }
}

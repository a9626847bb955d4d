//! Line commands read from stdin.

use std::str::FromStr;

use pairsync_link::{LinkHandle, Selection};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Report a local caret move.
    Open { path: String, line: u32, column: u32 },
    Switch,
    Enable,
    Disable,
    Status,
    Quit,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}; try open, switch, enable, disable, status or quit")]
    Unknown(String),
    #[error("usage: open <path> <line> <column>")]
    OpenUsage,
}

impl FromStr for ConsoleCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseError::Empty)?;
        let command = match verb {
            "open" => {
                let (Some(path), Some(line), Some(column), None) =
                    (words.next(), words.next(), words.next(), words.next())
                else {
                    return Err(ParseError::OpenUsage);
                };
                Self::Open {
                    path: path.to_string(),
                    line: line.parse().map_err(|_| ParseError::OpenUsage)?,
                    column: column.parse().map_err(|_| ParseError::OpenUsage)?,
                }
            }
            "switch" => Self::Switch,
            "enable" => Self::Enable,
            "disable" => Self::Disable,
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

/// Drive `link` from `input` until `quit` or end of input.
pub async fn run<R>(link: &LinkHandle, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        execute(link, command).await;
    }
    Ok(())
}

async fn execute(link: &LinkHandle, command: ConsoleCommand) {
    let result = match command {
        ConsoleCommand::Open { path, line, column } => {
            link.publish_selection(Selection::new(path, line, column))
        }
        ConsoleCommand::Switch => link.switch_now().await,
        ConsoleCommand::Enable => link.enable().await,
        ConsoleCommand::Disable => link.disable().await,
        ConsoleCommand::Status => {
            let status = link.status();
            println!(
                "state={:?} port={} peer={} auto-reconnect={} reconnecting={}",
                status.state,
                status
                    .assigned_port
                    .map_or_else(|| "-".to_string(), |p| p.to_string()),
                status.peer_path.as_deref().unwrap_or("-"),
                status.auto_reconnect,
                status.reconnecting,
            );
            Ok(())
        }
        ConsoleCommand::Quit => Ok(()),
    };
    if let Err(e) = result {
        warn!(error = %e, "command failed");
        println!("error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_open() {
        assert_eq!(
            "open /src/lib.rs 12 4".parse(),
            Ok(ConsoleCommand::Open {
                path: "/src/lib.rs".to_string(),
                line: 12,
                column: 4,
            })
        );
    }

    #[test]
    fn open_needs_three_numbers_worth_of_arguments() {
        assert_eq!(
            "open /src/lib.rs 12".parse::<ConsoleCommand>(),
            Err(ParseError::OpenUsage)
        );
        assert_eq!(
            "open /src/lib.rs x 4".parse::<ConsoleCommand>(),
            Err(ParseError::OpenUsage)
        );
        assert_eq!(
            "open /a 1 2 3".parse::<ConsoleCommand>(),
            Err(ParseError::OpenUsage)
        );
    }

    #[test]
    fn parses_bare_verbs() {
        assert_eq!("switch".parse(), Ok(ConsoleCommand::Switch));
        assert_eq!("  status ".parse(), Ok(ConsoleCommand::Status));
        assert_eq!("exit".parse(), Ok(ConsoleCommand::Quit));
        assert_eq!(
            "jump".parse::<ConsoleCommand>(),
            Err(ParseError::Unknown("jump".to_string()))
        );
        assert_eq!("".parse::<ConsoleCommand>(), Err(ParseError::Empty));
    }

    #[tokio::test]
    async fn quit_stops_the_loop() {
        let link = pairsync_link::spawn(
            pairsync_link::LinkConfig::new(pairsync_link::Role::Peer, "/proj"),
            pairsync_link::PairStore::in_memory(),
            std::sync::Arc::new(crate::bridge::CommandBridge::new(None)),
            pairsync_link::FocusChain::new(),
        );
        let input: &[u8] = b"status\nbogus\nquit\nenable\n";
        run(&link, input).await.unwrap();
        // `enable` after `quit` was never executed.
        assert_eq!(link.status().state, pairsync_link::LinkState::Disabled);
    }
}

//! Remote Administration
//!
//! Operator commands carried on the control channel. Every command needs
//! the shared admin key; with no key configured the surface is disabled.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::error;

/// Delay before a `panic` exit.
pub const PANIC_DELAY: Duration = Duration::from_secs(5);

/// Default delay before a `shutdown`.
pub const DEFAULT_SHUTDOWN_DELAY: Duration = Duration::from_secs(10);

/// Exit code of a `panic` exit.
pub const PANIC_EXIT_CODE: i32 = 1;

/// Admin errors.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// No admin key configured.
    #[error("No authentication has been set up for remote server admin")]
    NotConfigured,

    /// Key did not match.
    #[error("Failed to validate authentication key. This request has been logged")]
    AuthFailed,

    /// Request lacked the command field.
    #[error("Admin request is missing field '{0}'")]
    MissingField(&'static str),

    /// `shutdown` delay was not a non-negative integer.
    #[error("'{0}' is not a valid integer for parameter 'time'")]
    InvalidDelay(String),

    /// Command name not recognized.
    #[error("Unknown command '{command} [{args}]'")]
    UnknownCommand {
        /// Command name.
        command: String,
        /// Arguments, comma separated.
        args: String,
    },
}

/// A parsed admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    /// Unclean exit after [`PANIC_DELAY`].
    Panic,
    /// Graceful shutdown after the delay.
    Shutdown {
        /// Time until the shutdown signal fires.
        delay: Duration,
    },
}

/// Text of a JSON argument as the operator typed it.
fn arg_text(arg: &Value) -> String {
    match arg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl AdminCommand {
    /// Parse `command` with its arguments.
    pub fn parse(command: &str, args: &[Value]) -> Result<Self, AdminError> {
        match command {
            "panic" => Ok(AdminCommand::Panic),
            "shutdown" => {
                let delay = match args.first() {
                    None => DEFAULT_SHUTDOWN_DELAY,
                    Some(arg) => {
                        let text = arg_text(arg);
                        let secs = text
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| AdminError::InvalidDelay(text.clone()))?;
                        Duration::from_secs(secs)
                    }
                };
                Ok(AdminCommand::Shutdown { delay })
            }
            _ => Err(AdminError::UnknownCommand {
                command: command.to_string(),
                args: args.iter().map(arg_text).collect::<Vec<_>>().join(", "),
            }),
        }
    }

    /// Parse the `c`/`p` fields of an admin packet.
    pub fn from_packet(packet: &Value) -> Result<Self, AdminError> {
        let command = packet
            .get("c")
            .and_then(Value::as_str)
            .ok_or(AdminError::MissingField("c"))?;
        let args = packet
            .get("p")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Self::parse(command, args)
    }

    /// Time until the command takes effect.
    pub fn delay(&self) -> Duration {
        match self {
            AdminCommand::Panic => PANIC_DELAY,
            AdminCommand::Shutdown { delay } => *delay,
        }
    }

    /// Acknowledgement returned to the operator.
    pub fn acknowledgement(&self) -> String {
        match self {
            AdminCommand::Panic => format!(
                "The server will perform a panic shutdown in {} seconds",
                self.delay().as_secs()
            ),
            AdminCommand::Shutdown { delay } => format!(
                "The server will perform a controlled shutdown in {} seconds",
                delay.as_secs()
            ),
        }
    }

    /// Arm the command's timer. Irrevocable once called.
    pub fn schedule(self, shutdown: Arc<watch::Sender<bool>>) {
        let delay = self.delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match self {
                AdminCommand::Panic => {
                    error!("Panic exit");
                    std::process::exit(PANIC_EXIT_CODE);
                }
                AdminCommand::Shutdown { .. } => {
                    error!("Controlled shutdown starting");
                    shutdown.send_replace(true);
                }
            }
        });
    }
}

/// Check a supplied key against the configured one.
pub fn authorize(configured: Option<&str>, supplied: Option<&str>) -> Result<(), AdminError> {
    let Some(expected) = configured else {
        return Err(AdminError::NotConfigured);
    };
    match supplied {
        Some(key) if key == expected => Ok(()),
        _ => Err(AdminError::AuthFailed),
    }
}

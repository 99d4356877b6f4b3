//! # CLI Command Channel
//!
//! Line-oriented access to the INAV CLI over the MSP link.
//!
//! Entering the CLI is done by sending a single `#`. Every command line is
//! echoed back, followed by its output and a fresh `# ` prompt. A batch stops
//! at the first command that fails; earlier commands have already changed
//! the FC's settings and are not rolled back.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DeviceMode, Session};
use crate::error::{FcLinkError, Result};
use crate::serial::Transport;

/// Prompt printed after the banner and after every command
const CLI_PROMPT: &[u8] = b"\r\n# ";

/// Line that switches the FC from MSP into the CLI
const CLI_ENTER: &[u8] = b"#";

/// Silence after the prompt that marks the end of a response
const CLI_QUIET: Duration = Duration::from_millis(50);

/// Prefix INAV puts on lines reporting a failed command
const CLI_ERROR_MARKER: &str = "###ERROR";

/// A command and what the CLI printed for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    /// Output after the echo, prompt removed
    pub output: String,
}

/// The command that stopped a batch
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the failing command in the batch
    pub index: usize,
    pub command: String,
    pub error: FcLinkError,
}

/// Results of a batch, in order, up to the first failure
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<CommandResult>,
    pub failure: Option<BatchFailure>,
}

impl BatchOutcome {
    /// Whether every command ran
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Split a raw CLI response into its echoed line and output
fn split_response(raw: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(raw).into_owned();
    let text = text.strip_suffix("# ").unwrap_or(text.as_str());

    let mut lines = text
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .skip_while(|line| line.trim().is_empty());

    let echo = lines.next().unwrap_or_default().trim().to_string();
    let output = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    (echo, output)
}

impl<T: Transport> Session<T> {
    /// Switch the FC into its CLI
    ///
    /// # Errors
    ///
    /// Returns [`FcLinkError::CliTimeout`] if the prompt does not appear
    pub async fn enter_cli(&mut self) -> Result<CommandChannel<'_, T>> {
        self.rx.clear();
        self.write_raw(CLI_ENTER).await?;

        let timeout = self.options.cli_timeout;
        match self.read_until_quiet(CLI_PROMPT, timeout, CLI_QUIET).await? {
            Some(banner) => {
                debug!("CLI banner: {}", String::from_utf8_lossy(&banner).trim());
                self.mode = DeviceMode::Cli;
                info!("Entered CLI");
                Ok(CommandChannel { session: self })
            }
            None => {
                self.mode = DeviceMode::Unknown;
                Err(FcLinkError::CliTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Open CLI on a session
///
/// Borrows the session exclusively; MSP requests are not possible until the
/// channel is gone. [`CommandChannel::save`] and [`CommandChannel::exit`]
/// consume it.
pub struct CommandChannel<'a, T: Transport> {
    session: &'a mut Session<T>,
}

impl<'a, T: Transport> CommandChannel<'a, T> {
    /// Run one command and return its output
    ///
    /// # Errors
    ///
    /// - [`FcLinkError::CliTimeout`] if the prompt does not come back
    /// - [`FcLinkError::CliEchoMismatch`] if the echoed line differs from `command`
    /// - [`FcLinkError::CliRejected`] if the CLI reported an error
    pub async fn run(&mut self, command: &str) -> Result<String> {
        let command = command.trim();
        let line = format!("{}\n", command);
        self.session.write_raw(line.as_bytes()).await?;

        let timeout = self.session.options.cli_timeout;
        let raw = self
            .session
            .read_until_quiet(CLI_PROMPT, timeout, CLI_QUIET)
            .await?
            .ok_or(FcLinkError::CliTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })?;

        let (echo, output) = split_response(&raw);
        if echo != command {
            warn!("CLI echoed {:?} for {:?}", echo, command);
            return Err(FcLinkError::CliEchoMismatch {
                sent: command.to_string(),
                echoed: echo,
            });
        }

        if output.lines().any(|l| l.starts_with(CLI_ERROR_MARKER)) {
            return Err(FcLinkError::CliRejected {
                command: command.to_string(),
                output,
            });
        }

        debug!("CLI {:?}: {} bytes of output", command, output.len());
        Ok(output)
    }

    /// Run commands in order, stopping at the first failure
    pub async fn run_batch<S: AsRef<str>>(&mut self, commands: &[S]) -> BatchOutcome {
        let mut results = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            let command = command.as_ref();
            match self.run(command).await {
                Ok(output) => results.push(CommandResult {
                    command: command.to_string(),
                    output,
                }),
                Err(error) => {
                    warn!("Batch stopped at command {} ({:?}): {}", index, command, error);
                    return BatchOutcome {
                        results,
                        failure: Some(BatchFailure {
                            index,
                            command: command.to_string(),
                            error,
                        }),
                    };
                }
            }
        }

        BatchOutcome {
            results,
            failure: None,
        }
    }

    /// Full settings diff
    pub async fn diff_all(&mut self) -> Result<String> {
        self.run("diff all").await
    }

    /// Persist settings. The FC reboots afterwards.
    pub async fn save(self) -> Result<()> {
        self.leave("save").await
    }

    /// Leave the CLI without saving. The FC reboots afterwards.
    pub async fn exit(self) -> Result<()> {
        self.leave("exit").await
    }

    async fn leave(self, command: &str) -> Result<()> {
        self.session.write_raw(format!("{}\n", command).as_bytes()).await?;
        self.session.mode = DeviceMode::Unknown;

        // Drain the reboot notice; the port may vanish as the FC restarts
        let timeout = self.session.options.cli_timeout;
        if let Err(e) = self.session.read_until_quiet(b"", timeout, CLI_QUIET).await {
            debug!("Link dropped after {:?}: {}", command, e);
        }
        self.session.rx.clear();

        info!("Left CLI with {:?}, FC is rebooting", command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::port_trait::mocks::FakeFlightController;
    use crate::session::SessionOptions;

    fn options() -> SessionOptions {
        SessionOptions {
            request_timeout: Duration::from_millis(100),
            retries: 1,
            chunk_size: 256,
            chunk_retries: 1,
            cli_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_split_response() {
        let (echo, output) = split_response(b"get name\r\nname = QUAD5\r\n\r\n# ");
        assert_eq!(echo, "get name");
        assert_eq!(output, "name = QUAD5");

        let (echo, output) = split_response(b"\r\nset x = 1\r\n\r\n# ");
        assert_eq!(echo, "set x = 1");
        assert!(output.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_cli_and_run() {
        let mut fake = FakeFlightController::new();
        fake.cli_outputs
            .insert("get name".to_string(), "name = QUAD5".to_string());
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        let output = cli.run("get name").await.unwrap();
        assert_eq!(output, "name = QUAD5");
        drop(cli);

        assert_eq!(session.device_mode(), DeviceMode::Cli);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_mismatch() {
        let mut fake = FakeFlightController::new();
        fake.cli_echo_overrides
            .insert("set roll_rate = 70".to_string(), "set roll_rate = 7".to_string());
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        let result = cli.run("set roll_rate = 70").await;
        match result {
            Err(FcLinkError::CliEchoMismatch { sent, echoed }) => {
                assert_eq!(sent, "set roll_rate = 70");
                assert_eq!(echoed, "set roll_rate = 7");
            }
            other => panic!("Expected CliEchoMismatch, got: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_output_is_rejected() {
        let mut fake = FakeFlightController::new();
        fake.cli_outputs.insert(
            "set bogus = 1".to_string(),
            "###ERROR IN set: INVALID NAME: bogus###".to_string(),
        );
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        let result = cli.run("set bogus = 1").await;
        assert!(matches!(result, Err(FcLinkError::CliRejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_prompt_times_out() {
        let mut fake = FakeFlightController::new();
        fake.cli_silent_lines.insert("status".to_string());
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        let result = cli.run("status").await;
        assert!(matches!(result, Err(FcLinkError::CliTimeout { timeout_ms: 500 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_runs_all() {
        let fake = FakeFlightController::new();
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        let outcome = cli
            .run_batch(&["set a = 1", "set b = 2", "set c = 3"])
            .await;

        assert!(outcome.is_complete());
        let commands: Vec<_> = outcome.results.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["set a = 1", "set b = 2", "set c = 3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_stops_at_first_mismatch() {
        let mut fake = FakeFlightController::new();
        fake.cli_echo_overrides
            .insert("set b = 2".to_string(), "set b = 20".to_string());
        let state = fake.state();
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        let commands = vec!["set a = 1".to_string(), "set b = 2".to_string(), "set c = 3".to_string()];
        let outcome = cli.run_batch(&commands).await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].command, "set a = 1");
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.index, 1);
        assert_eq!(failure.command, "set b = 2");
        assert!(matches!(failure.error, FcLinkError::CliEchoMismatch { .. }));

        // Nothing after the failing command was sent
        let state = state.lock().unwrap();
        assert!(!state.raw_writes.iter().any(|w| w.as_slice() == b"set c = 3\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_diff_all() {
        let mut fake = FakeFlightController::new();
        fake.cli_outputs.insert(
            "diff all".to_string(),
            "# diff all\r\nset name = QUAD5\r\nset looptime = 500".to_string(),
        );
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        let diff = cli.diff_all().await.unwrap();
        assert!(diff.contains("set looptime = 500"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_leaves_device_mode_unknown() {
        let fake = FakeFlightController::new();
        let state = fake.state();
        let mut session = Session::new(fake, options());

        let mut cli = session.enter_cli().await.unwrap();
        cli.run("set a = 1").await.unwrap();
        cli.save().await.unwrap();

        assert_eq!(session.device_mode(), DeviceMode::Unknown);
        assert!(state
            .lock()
            .unwrap()
            .raw_writes
            .iter()
            .any(|w| w.as_slice() == b"save\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_returns_to_msp_traffic() {
        let fake = FakeFlightController::new();
        let mut session = Session::new(fake, options());

        let cli = session.enter_cli().await.unwrap();
        cli.exit().await.unwrap();

        assert_eq!(session.device_mode(), DeviceMode::Unknown);
        let info = session.identify().await.unwrap();
        assert_eq!(info.fc_variant, "INAV");
    }
}

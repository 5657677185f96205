use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::time::{Instant, timeout, timeout_at};

use crate::error::SshError;

use super::SwitchSession;
use super::handler::ClientHandler;

/// Prompt at the end of the shell buffer: `user@switch> `, `user@switch# `, `% `.
static PROMPT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\w.@:()\-]+)[>#%]\s*$").expect("prompt regex"));

/// Whether the last line of `output` is a CLI prompt.
pub fn ends_with_prompt(output: &str) -> bool {
    let last = output.rsplit('\n').next().unwrap_or(output);
    let last = last.trim_end_matches('\r');
    last.len() < 256 && PROMPT_REGEX.is_match(last)
}

/// Whether the switch refused a CLI line.
pub fn is_cli_rejection(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("error:") || lower.contains("syntax error") || lower.contains("unknown command")
}

/// Whether the shell is sitting in configuration mode.
fn in_configuration_mode(output: &str) -> bool {
    output.trim_end().ends_with('#')
}

/// How long the shell must stay silent before a resync sends its blank line.
const QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Shell output not yet attributed to a sent line.
///
/// A reply belongs to a line only when it follows that line's echo and ends
/// at a prompt. Anything before the echo is late output from an earlier
/// line that timed out, and is discarded.
#[derive(Debug, Default)]
pub struct ShellBuffer {
    pending: String,
}

impl ShellBuffer {
    pub fn push(&mut self, data: &str) {
        self.pending.push_str(data);
    }

    pub fn clear(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Take the reply to `line` once it is complete.
    pub fn take_reply(&mut self, line: &str) -> Option<String> {
        let echo = line.trim();
        let start = if echo.is_empty() {
            0
        } else {
            self.pending.rfind(echo)? + echo.len()
        };
        let reply = &self.pending[start..];
        if !ends_with_prompt(reply) {
            return None;
        }
        let reply = reply.to_string();
        self.pending.clear();
        Some(reply)
    }
}

/// Authenticated switch session: an interactive shell for configuration plus
/// exec channels for read-only queries.
pub struct SshSession {
    handle: Handle<ClientHandler>,
    shell: Channel<Msg>,
    host: String,
    command_timeout: Duration,
    buffer: ShellBuffer,
    /// False while a sent line has no attributed reply yet.
    in_sync: bool,
    closed: bool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .field("handle", &"<handle>")
            .field("closed", &self.closed)
            .finish()
    }
}

impl SshSession {
    /// Open the interactive shell and wait for the first prompt.
    pub(crate) async fn open(
        handle: Handle<ClientHandler>,
        host: String,
        command_timeout: Duration,
    ) -> Result<Self, SshError> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;

        // Wide terminal so the CLI does not wrap interface tables
        channel
            .request_pty(false, "vt100", 200, 48, 0, 0, &[])
            .await
            .map_err(|e| SshError::Channel(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::Channel(format!("Shell request failed: {}", e)))?;

        let mut session = Self {
            handle,
            shell: channel,
            host,
            command_timeout,
            buffer: ShellBuffer::default(),
            in_sync: true,
            closed: false,
        };

        let banner = session.read_reply("").await?;
        tracing::debug!(host = %session.host, "Shell ready ({} bytes of banner)", banner.len());

        Ok(session)
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SshError> {
        let data = format!("{}\n", line);
        self.shell
            .data(data.as_bytes())
            .await
            .map_err(|e| SshError::Channel(format!("Failed to send '{}': {}", line, e)))
    }

    /// Send `line` and read its reply. The session stays out of sync until
    /// the reply arrives, so a timeout or a dropped future forces a resync
    /// before the next configuration step.
    async fn exchange(&mut self, line: &str) -> Result<String, SshError> {
        self.in_sync = false;
        self.send_line(line).await?;
        let reply = self.read_reply(line).await?;
        self.in_sync = true;
        Ok(reply)
    }

    async fn read_reply(&mut self, line: &str) -> Result<String, SshError> {
        let deadline = Instant::now() + self.command_timeout;

        loop {
            if let Some(reply) = self.buffer.take_reply(line) {
                return Ok(reply);
            }
            match timeout_at(deadline, self.shell.wait()).await {
                Err(_) => {
                    return Err(SshError::Timeout(format!(
                        "{}: no prompt within {}s",
                        self.host,
                        self.command_timeout.as_secs()
                    )));
                }
                Ok(Some(ChannelMsg::Data { data }))
                | Ok(Some(ChannelMsg::ExtendedData { data, .. })) => {
                    self.buffer.push(&String::from_utf8_lossy(&data));
                }
                Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) | Ok(None) => {
                    return Err(SshError::Channel(format!(
                        "{}: shell closed by switch",
                        self.host
                    )));
                }
                Ok(Some(_)) => {}
            }
        }
    }

    /// Drop uncommitted changes and leave configuration mode after a rejection.
    async fn abandon_configuration(&mut self) {
        for line in ["rollback 0", "exit configuration-mode"] {
            if self.exchange(line).await.is_err() {
                tracing::warn!(host = %self.host, "Could not leave configuration mode cleanly");
                return;
            }
        }
    }

    /// Bring the shell back to a fresh operational prompt after a line went
    /// unanswered: wait for the output to go quiet, discard it, then answer a
    /// blank line with a prompt.
    async fn resync(&mut self) -> Result<(), SshError> {
        tracing::debug!(host = %self.host, "Resynchronizing shell");
        let deadline = Instant::now() + self.command_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(SshError::Channel(format!(
                    "{}: shell output did not settle",
                    self.host
                )));
            }
            match timeout(QUIET_PERIOD, self.shell.wait()).await {
                Err(_) => break,
                Ok(Some(ChannelMsg::Data { data }))
                | Ok(Some(ChannelMsg::ExtendedData { data, .. })) => {
                    self.buffer.push(&String::from_utf8_lossy(&data));
                }
                Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) | Ok(None) => {
                    return Err(SshError::Channel(format!(
                        "{}: shell closed by switch",
                        self.host
                    )));
                }
                Ok(Some(_)) => {}
            }
        }

        let late = self.buffer.clear();
        if !late.is_empty() {
            tracing::warn!(host = %self.host, "Discarded late shell output: {:?}", late.trim());
        }

        let prompt = self.exchange("").await?;
        if in_configuration_mode(&prompt) {
            self.abandon_configuration().await;
            if !self.in_sync {
                return Err(SshError::Channel(format!(
                    "{}: could not leave configuration mode",
                    self.host
                )));
            }
        }
        Ok(())
    }

    /// Execute a command on a separate exec channel and return its stdout.
    async fn exec(&self, command: &str) -> Result<String, SshError> {
        let timeout_result = timeout(self.command_timeout, async {
            let mut channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| SshError::Channel(format!("Failed to open channel: {}", e)))?;

            channel
                .exec(true, command)
                .await
                .map_err(|e| SshError::Channel(format!("Failed to exec '{}': {}", command, e)))?;

            let mut output = String::new();

            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        output.push_str(&String::from_utf8_lossy(&data));
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        tracing::debug!("{} stderr: {:?}", command, String::from_utf8_lossy(&data));
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        if exit_status != 0 {
                            tracing::debug!("{} exited with status {}", command, exit_status);
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        break;
                    }
                    Some(_) => {}
                }
            }

            Ok(output)
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(SshError::Timeout(format!(
                "Command '{}' timed out after {} seconds",
                command,
                self.command_timeout.as_secs()
            ))),
        }
    }
}

impl SwitchSession for SshSession {
    async fn query(&mut self, command: &str) -> Result<String, SshError> {
        tracing::debug!(host = %self.host, command, "query");
        self.exec(command).await
    }

    async fn configure(&mut self, commands: &[String]) -> Result<String, SshError> {
        if !self.in_sync {
            self.resync().await?;
        }

        let mut last = String::new();
        for command in commands {
            tracing::debug!(host = %self.host, command = %command, "configure");
            let output = self.exchange(command).await?;

            if is_cli_rejection(&output) {
                if in_configuration_mode(&output) {
                    self.abandon_configuration().await;
                }
                return Err(SshError::CommandRejected {
                    command: command.clone(),
                    output: output.trim().to_string(),
                });
            }
            last = output;
        }

        Ok(last)
    }

    async fn close(mut self) {
        let _ = self.shell.eof().await;
        let _ = self.shell.close().await;
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(host = %self.host, "Disconnect failed: {}", e);
        }
        self.closed = true;
        tracing::debug!(host = %self.host, "Session closed");
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(host = %self.host, "SSH session dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_operational_and_configuration_prompts() {
        assert!(ends_with_prompt("\r\nnetops@access-sw1> "));
        assert!(ends_with_prompt("[edit]\r\nnetops@access-sw1# "));
        assert!(ends_with_prompt("root@sw:RE:0% "));
        assert!(ends_with_prompt("--- JUNOS 21.4R3 built\r\n\r\nnetops@sw> "));
    }

    #[test]
    fn ignores_partial_output() {
        assert!(!ends_with_prompt("commit complete\r\n"));
        assert!(!ends_with_prompt("Interface       Admin Link Description\r\nge-0/0/7"));
        assert!(!ends_with_prompt(""));
    }

    #[test]
    fn recognizes_rejections() {
        assert!(is_cli_rejection(
            "error: configuration database locked by:\r\n  admin terminal p0"
        ));
        assert!(is_cli_rejection("syntax error, expecting <command>."));
        assert!(is_cli_rejection("unknown command."));
        assert!(!is_cli_rejection("commit complete\r\nExiting configuration mode"));
    }

    #[test]
    fn reply_follows_echo_and_ends_at_prompt() {
        let mut buffer = ShellBuffer::default();
        buffer.push("configure\r\nEntering configuration mode\r\n");
        assert_eq!(buffer.take_reply("configure"), None);
        buffer.push("[edit]\r\nnetops@sw# ");
        let reply = buffer.take_reply("configure").unwrap();
        assert!(reply.contains("Entering configuration mode"));
        assert!(!reply.contains("configure\r"));
    }

    #[test]
    fn late_commit_reply_does_not_answer_next_line() {
        let mut buffer = ShellBuffer::default();
        // Disable commit timed out; its acknowledgment arrives during the
        // enable's first line, before that line's own echo
        buffer.push("commit complete\r\nExiting configuration mode\r\n\r\nnetops@sw> ");
        assert_eq!(buffer.take_reply("configure"), None);

        buffer.push("configure\r\nEntering configuration mode\r\n[edit]\r\nnetops@sw# ");
        let reply = buffer.take_reply("configure").unwrap();
        assert!(!reply.contains("commit complete"));

        buffer.push("delete poe interface ge-0/0/7 disable\r\n[edit]\r\nnetops@sw# ");
        assert!(buffer.take_reply("delete poe interface ge-0/0/7 disable").is_some());

        // The commit's echo has arrived but its acknowledgment has not
        buffer.push("commit and-quit\r\n");
        assert_eq!(buffer.take_reply("commit and-quit"), None);
        buffer.push("commit complete\r\nExiting configuration mode\r\n\r\nnetops@sw> ");
        let reply = buffer.take_reply("commit and-quit").unwrap();
        assert!(reply.contains("commit complete"));
    }

    #[test]
    fn blank_line_takes_any_complete_prompt() {
        let mut buffer = ShellBuffer::default();
        buffer.push("--- JUNOS 21.4R3 built\r\n\r\nnetops@sw> ");
        assert!(buffer.take_reply("").is_some());
        assert!(buffer.clear().is_empty());
    }

    #[test]
    fn configuration_mode_from_prompt() {
        assert!(in_configuration_mode("error: commit failed\r\n[edit]\r\nnetops@sw# "));
        assert!(!in_configuration_mode("netops@sw> "));
    }
}

//! ICMP probing through the host's `ping` binary.

use std::io::ErrorKind as IoErrorKind;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::{ProbeEvent, ProbeResult, ProbeStream, Prober, parse};
use crate::config::ProbeSettings;
use crate::error::ProbeError;

/// Slack on top of `count * per_probe_timeout` before the process is killed.
const DEADLINE_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SystemPinger {
    program: String,
    per_probe_timeout: Duration,
}

impl SystemPinger {
    pub fn new(per_probe_timeout: Duration) -> Self {
        Self {
            program: "ping".to_string(),
            per_probe_timeout,
        }
    }

    pub fn from_settings(settings: &ProbeSettings) -> Self {
        Self::new(Duration::from_secs(settings.per_probe_timeout_secs.max(1)))
    }

    /// Use a different binary, e.g. an absolute path to `ping`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, address: IpAddr, count: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(count.to_string())
            .arg("-W")
            .arg(self.per_probe_timeout.as_secs().max(1).to_string())
            .arg(address.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Prober for SystemPinger {
    fn probe_stream(&self, address: IpAddr, count: u32) -> ProbeStream {
        let mut cmd = self.command(address, count);
        let program = self.program.clone();
        let deadline = tokio::time::Instant::now() + self.per_probe_timeout * count + DEADLINE_SLACK;

        async_stream::stream! {
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) if e.kind() == IoErrorKind::NotFound => {
                    yield Err(ProbeError::Unavailable(format!("'{}' not found on this host", program)));
                    return;
                }
                Err(e) if e.kind() == IoErrorKind::PermissionDenied => {
                    yield Err(ProbeError::Unavailable(format!("'{}' not permitted: {}", program, e)));
                    return;
                }
                Err(e) => {
                    yield Err(ProbeError::Io(e.to_string()));
                    return;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                yield Err(ProbeError::Io("ping stdout not captured".to_string()));
                return;
            };
            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut text = String::new();
                    let _ = stderr.read_to_string(&mut text).await;
                    text
                })
            });

            let mut lines = BufReader::new(stdout).lines();
            let mut raw_lines = Vec::new();
            let mut latency_samples = Vec::new();
            let mut replies = 0u32;

            loop {
                match tokio::time::timeout_at(deadline, lines.next_line()).await {
                    Ok(Ok(Some(line))) => {
                        let line = line.trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if parse::is_reply(&line) {
                            replies += 1;
                            if let Some(latency) = parse::reply_latency(&line) {
                                latency_samples.push(latency);
                            }
                        }
                        raw_lines.push(line.clone());
                        yield Ok(ProbeEvent::Line(line));
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        yield Err(ProbeError::Io(e.to_string()));
                        return;
                    }
                    Err(_) => {
                        tracing::debug!(%address, "ping overran its deadline, killing");
                        let _ = child.start_kill();
                        break;
                    }
                }
            }

            let status = child.wait().await;
            let stderr_text = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };

            if replies == 0 {
                if parse::is_resolution_failure(&stderr_text) {
                    yield Err(ProbeError::AddressInvalid(address.to_string()));
                    return;
                }
                if parse::is_permission_failure(&stderr_text) {
                    yield Err(ProbeError::Unavailable(stderr_text.trim().to_string()));
                    return;
                }
            }

            tracing::debug!(
                %address,
                replies,
                exit = ?status.ok().and_then(|s| s.code()),
                "ping finished"
            );

            yield Ok(ProbeEvent::Finished(ProbeResult {
                address,
                reachable: replies > 0,
                raw_lines,
                latency_samples,
            }));
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_uses_count_and_timeout() {
        let pinger = SystemPinger::new(Duration::from_secs(3));
        let cmd = pinger.command("10.0.0.5".parse().unwrap(), 4);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["-c", "4", "-W", "3", "10.0.0.5"]);
        assert_eq!(cmd.as_std().get_program(), "ping");
    }

    #[test]
    fn sub_second_timeout_rounds_up() {
        let pinger = SystemPinger::new(Duration::from_millis(200));
        let cmd = pinger.command("10.0.0.5".parse().unwrap(), 1);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[3], "1");
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let pinger = SystemPinger::new(Duration::from_secs(1))
            .with_program("/nonexistent/definitely-not-ping");
        let err = pinger
            .probe("127.0.0.1".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable(_)));
    }
}

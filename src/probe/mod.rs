//! Reachability probing.
//!
//! Streaming is the primary mode: a prober produces a finite sequence of
//! output lines followed by one terminal [`ProbeEvent::Finished`]. The
//! aggregate mode is a fold over that stream, so both modes share the same
//! success policy.

pub mod parse;
pub mod ping;

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::ProbeError;

pub use ping::SystemPinger;

/// Result of one probe invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub address: IpAddr,
    /// At least one probe got a reply before its timeout.
    pub reachable: bool,
    pub raw_lines: Vec<String>,
    pub latency_samples: Vec<Duration>,
}

impl ProbeResult {
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let total: Duration = self.latency_samples.iter().sum();
        Some(total / self.latency_samples.len() as u32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    Line(String),
    Finished(ProbeResult),
}

/// Lazy, finite, non-restartable probe output.
pub type ProbeStream = BoxStream<'static, Result<ProbeEvent, ProbeError>>;

pub trait Prober: Send + Sync + 'static {
    /// Send `count` probes to `address`, yielding each output line as it arrives.
    fn probe_stream(&self, address: IpAddr, count: u32) -> ProbeStream;

    /// Send `count` probes and report only the final classification.
    fn probe(
        &self,
        address: IpAddr,
        count: u32,
    ) -> impl Future<Output = Result<ProbeResult, ProbeError>> + Send {
        collect_result(self.probe_stream(address, count))
    }
}

/// Drain a probe stream down to its terminal result.
pub async fn collect_result(mut stream: ProbeStream) -> Result<ProbeResult, ProbeError> {
    while let Some(event) = stream.next().await {
        if let ProbeEvent::Finished(result) = event? {
            return Ok(result);
        }
    }
    Err(ProbeError::Unavailable(
        "probe ended without a result".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn addr() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    fn finished(reachable: bool) -> ProbeResult {
        ProbeResult {
            address: addr(),
            reachable,
            raw_lines: vec!["line".to_string()],
            latency_samples: vec![Duration::from_millis(2), Duration::from_millis(4)],
        }
    }

    #[tokio::test]
    async fn collect_returns_terminal_result() {
        let events = vec![
            Ok(ProbeEvent::Line("line".to_string())),
            Ok(ProbeEvent::Finished(finished(true))),
        ];
        let result = collect_result(stream::iter(events).boxed()).await.unwrap();
        assert!(result.reachable);
        assert_eq!(result.average_latency(), Some(Duration::from_millis(3)));
    }

    #[tokio::test]
    async fn collect_propagates_errors() {
        let events = vec![
            Ok(ProbeEvent::Line("line".to_string())),
            Err(ProbeError::Unavailable("no ping".to_string())),
        ];
        let err = collect_result(stream::iter(events).boxed()).await.unwrap_err();
        assert_eq!(err, ProbeError::Unavailable("no ping".to_string()));
    }

    #[tokio::test]
    async fn stream_without_result_is_unavailable() {
        let events = vec![Ok(ProbeEvent::Line("line".to_string()))];
        let err = collect_result(stream::iter(events).boxed()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable(_)));
    }
}

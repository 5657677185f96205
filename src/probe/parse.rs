//! Parsers for `ping` output lines.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static LATENCY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time[=<]\s*([\d.]+)\s*ms").expect("latency regex"));

/// Whether a line reports an echo reply.
///
/// Linux/BSD: `64 bytes from 10.0.0.5: icmp_seq=1 ttl=64 time=0.412 ms`.
/// Lines such as `From 10.0.0.1 icmp_seq=1 Destination Host Unreachable`
/// are not replies.
pub fn is_reply(line: &str) -> bool {
    line.contains("bytes from")
}

/// Round-trip time reported on a reply line.
pub fn reply_latency(line: &str) -> Option<Duration> {
    let caps = LATENCY_REGEX.captures(line)?;
    let ms: f64 = caps.get(1)?.as_str().parse().ok()?;
    if !ms.is_finite() || ms < 0.0 {
        return None;
    }
    Some(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
}

/// Whether stderr text means the target name could not be resolved.
pub fn is_resolution_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "unknown host",
        "name or service not known",
        "cannot resolve",
        "temporary failure in name resolution",
        "bad address",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Whether stderr text means the host is not allowed to send probes.
pub fn is_permission_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("operation not permitted") || lower.contains("permission denied")
}

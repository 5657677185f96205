//! SSH access to switches.
//!
//! The engine talks to switches only through [`SessionConnector`] and
//! [`SwitchSession`]; [`SshClient`] is the russh-backed implementation.

pub mod client;
pub mod diagnostics;
pub mod handler;
pub mod retry;
pub mod session;

use std::future::Future;

use crate::device::Device;
use crate::error::SshError;

pub use client::SshClient;
pub use diagnostics::{DiagnosticKind, SshDiagnostics, analyze_ssh_error};
pub use retry::RetryPolicy;
pub use session::SshSession;

/// One authenticated CLI session on a switch, owned by exactly one worker.
pub trait SwitchSession: Send {
    /// Run a read-only operational command and return its output.
    fn query(&mut self, command: &str) -> impl Future<Output = Result<String, SshError>> + Send;

    /// Send a sequence of CLI lines in order, returning the reply to the
    /// last line only.
    ///
    /// Fails with [`SshError::CommandRejected`] on the first line the switch
    /// refuses; later lines are not sent. If an earlier call was interrupted
    /// before its reply arrived, the session resynchronizes first so a late
    /// reply is never taken for this call's.
    fn configure(
        &mut self,
        commands: &[String],
    ) -> impl Future<Output = Result<String, SshError>> + Send;

    /// Tear the session down. Never fails; errors are logged.
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized;
}

/// Opens sessions in two observable steps so the workflow can report
/// `Connecting` and `Authenticating` separately.
pub trait SessionConnector: Send + Sync + 'static {
    /// Transport that is connected but not yet authenticated.
    type Transport: Send;
    type Session: SwitchSession + 'static;

    fn connect(
        &self,
        device: &Device,
    ) -> impl Future<Output = Result<Self::Transport, SshError>> + Send;

    fn authenticate(
        &self,
        transport: Self::Transport,
    ) -> impl Future<Output = Result<Self::Session, SshError>> + Send;
}

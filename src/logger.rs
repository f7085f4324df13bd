use crate::protocol::messages::LoggerField;

/// Verbosity levels shared with the daemon.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error = 0,
    Warn = 1,
    Notice = 2,
    Info = 3,
    Talkative = 4,
    Chatty = 5,
    Debug = 6,
    Vomit = 7,
}

/// Sink for the daemon's progress and log events.
///
/// Implementations must not call back into the store: the events are
/// delivered while a connection is held, and a re-entrant store call
/// would deadlock a pool of size one.
pub trait Logger: Send + Sync {
    fn start_activity(
        &self,
        id: u64,
        level: u64,
        activity_type: u64,
        text: &str,
        fields: &[LoggerField],
        parent: u64,
    );

    fn stop_activity(&self, id: u64);

    fn result(&self, id: u64, result_type: u64, fields: &[LoggerField]);

    fn print_error(&self, message: &str);
}

/// Default logger forwarding daemon events to `tracing`.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn start_activity(
        &self,
        id: u64,
        level: u64,
        activity_type: u64,
        text: &str,
        _fields: &[LoggerField],
        parent: u64,
    ) {
        tracing::debug!(id, level, activity_type, parent, "daemon activity started: {text}");
    }

    fn stop_activity(&self, id: u64) {
        tracing::debug!(id, "daemon activity stopped");
    }

    fn result(&self, id: u64, result_type: u64, _fields: &[LoggerField]) {
        tracing::trace!(id, result_type, "daemon activity result");
    }

    fn print_error(&self, message: &str) {
        tracing::warn!("[nix-daemon]: {message}");
    }
}

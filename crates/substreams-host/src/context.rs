//! Per-call state shared by every host import.
//!
//! A [`CallContext`] is installed in the instance before each entrypoint call
//! and taken back afterwards. Host imports record their first failure here;
//! that failure outranks whatever trap the guest surfaces with.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use substreams_core::Clock;
use substreams_store::KvStore;

use crate::cancel::CancelToken;
use crate::config::DEFAULT_LOG_LIMIT;
use crate::error::{CallError, GuestError, GuestResult};
use crate::extensions::ExtensionRegistry;

pub type SharedKvStore = Arc<Mutex<KvStore>>;

/// One entrypoint argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    /// Copied into guest memory and passed as `(ptr, len)`.
    Bytes(Vec<u8>),
    /// Passed as a single `i32`; indexes the readable stores.
    StoreIndex(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicInfo {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub host_calls: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Result of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOutcome {
    pub output: Option<Vec<u8>>,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
    pub stats: CallStats,
}

/// Guest log lines, capped in bytes. The oldest lines are evicted first, so
/// the buffer always holds the most recent output.
#[derive(Debug, Clone)]
pub(crate) struct LogBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    truncated: bool,
}

impl LogBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, mut line: String) {
        if line.len() > self.limit {
            // Keep the end of an oversized line.
            let mut cut = line.len() - self.limit;
            while !line.is_char_boundary(cut) {
                cut += 1;
            }
            line.drain(..cut);
            self.truncated = true;
        }
        while self.bytes + line.len() > self.limit {
            let Some(old) = self.lines.pop_front() else {
                break;
            };
            self.bytes -= old.len();
            self.truncated = true;
        }
        self.bytes += line.len();
        self.lines.push_back(line);
    }

    fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

pub struct CallContext {
    pub(crate) module: String,
    pub(crate) clock: Clock,
    pub(crate) readers: Vec<SharedKvStore>,
    pub(crate) writer: Option<SharedKvStore>,
    pub(crate) output: Option<Vec<u8>>,
    pub(crate) panic: Option<PanicInfo>,
    pub(crate) logs: LogBuffer,
    pub(crate) failure: Option<GuestError>,
    pub(crate) cancel: CancelToken,
    pub(crate) extensions: Arc<ExtensionRegistry>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) stats: CallStats,
}

impl CallContext {
    pub fn new(module: impl Into<String>, clock: Clock) -> Self {
        Self {
            module: module.into(),
            clock,
            readers: Vec::new(),
            writer: None,
            output: None,
            panic: None,
            logs: LogBuffer::new(DEFAULT_LOG_LIMIT),
            failure: None,
            cancel: CancelToken::never(),
            extensions: Arc::new(ExtensionRegistry::default()),
            deadline: None,
            stats: CallStats::default(),
        }
    }

    /// Placeholder held by an instance between calls.
    pub(crate) fn idle() -> Self {
        Self::new("", Clock::default())
    }

    /// Stores readable through `state.get_*`, by index.
    pub fn with_readers(mut self, readers: Vec<SharedKvStore>) -> Self {
        self.readers = readers;
        self
    }

    /// The store this call writes to. Only store modules get one.
    pub fn with_writer(mut self, writer: SharedKvStore) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_extensions(mut self, extensions: Arc<ExtensionRegistry>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_log_limit(mut self, bytes: usize) -> Self {
        self.logs = LogBuffer::new(bytes);
        self
    }

    pub(crate) fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Checked on entry to every host import.
    pub(crate) fn check(&self) -> GuestResult<()> {
        if self.cancel.is_canceled() {
            return Err(GuestError::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(GuestError::Timeout {
                    module: self.module.clone(),
                });
            }
        }
        Ok(())
    }

    /// Record a host-side failure. The first one wins.
    pub(crate) fn fail(&mut self, error: GuestError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    pub(crate) fn violation(&self, reason: impl Into<String>) -> GuestError {
        GuestError::ContractViolation {
            module: self.module.clone(),
            reason: reason.into(),
        }
    }

    /// Settle the call. A recorded host failure outranks a registered panic,
    /// which outranks the trap reported by the backend.
    pub(crate) fn finish(mut self, trap: Option<GuestError>) -> Result<CallOutcome, CallError> {
        let panic = self.panic.take().map(|p| GuestError::Panic {
            module: self.module.clone(),
            message: p.message,
            file: p.file,
            line: p.line,
            column: p.column,
        });
        let error = self.failure.take().or(panic).or(trap);
        match error {
            Some(error) => Err(CallError {
                error,
                logs_truncated: self.logs.truncated,
                logs: self.logs.into_lines(),
            }),
            None => Ok(CallOutcome {
                output: self.output,
                logs_truncated: self.logs.truncated,
                logs: self.logs.into_lines(),
                stats: self.stats,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_keeps_the_newest_lines() {
        let mut logs = LogBuffer::new(10);
        logs.push("old-1".into());
        logs.push("old-2".into());
        logs.push("newest".into());
        assert!(logs.truncated);
        assert_eq!(logs.into_lines(), vec!["newest"]);
    }

    #[test]
    fn log_buffer_under_limit_is_untouched() {
        let mut logs = LogBuffer::new(10);
        logs.push("ab".into());
        logs.push("cd".into());
        assert!(!logs.truncated);
        assert_eq!(logs.into_lines(), vec!["ab", "cd"]);
    }

    #[test]
    fn oversized_line_keeps_its_end() {
        let mut logs = LogBuffer::new(4);
        logs.push("first".into());
        logs.push("0123456789".into());
        assert!(logs.truncated);
        assert_eq!(logs.into_lines(), vec!["6789"]);
    }

    #[test]
    fn failure_outranks_panic_and_trap() {
        let mut ctx = CallContext::new("m", Clock::default());
        ctx.panic = Some(PanicInfo {
            message: "boom".into(),
            file: "m.rs".into(),
            line: 1,
            column: 1,
        });
        ctx.fail(GuestError::Canceled);
        ctx.fail(GuestError::Timeout { module: "m".into() });
        let err = ctx
            .finish(Some(GuestError::OutOfFuel { module: "m".into() }))
            .unwrap_err();
        assert!(matches!(err.error, GuestError::Canceled));
    }

    #[test]
    fn panic_without_trap_still_fails() {
        let mut ctx = CallContext::new("m", Clock::default());
        ctx.panic = Some(PanicInfo {
            message: "boom".into(),
            file: "m.rs".into(),
            line: 42,
            column: 3,
        });
        let err = ctx.finish(None).unwrap_err();
        assert!(matches!(err.error, GuestError::Panic { line: 42, .. }));
    }

    #[test]
    fn canceled_token_fails_check() {
        let (handle, token) = CancelToken::new();
        let ctx = CallContext::new("m", Clock::default()).with_cancel(token);
        assert!(ctx.check().is_ok());
        handle.cancel();
        assert!(matches!(ctx.check(), Err(GuestError::Canceled)));
    }
}

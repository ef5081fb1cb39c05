//! Worker exit-code convention.
//!
//! Every worker program, app or platform, terminates with one of:
//!
//! - `0`: success
//! - `50`: the worker recorded a domain error itself before exiting
//! - anything else, or death by signal: unclassified crash

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_HANDLED_FAILURE: i32 = 50;

/// How a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    HandledFailure,
    Crash,
}

impl WorkerExit {
    pub fn classify(&self) -> ExitClass {
        match self {
            WorkerExit::Code(EXIT_SUCCESS) => ExitClass::Success,
            WorkerExit::Code(EXIT_HANDLED_FAILURE) => ExitClass::HandledFailure,
            WorkerExit::Code(_) | WorkerExit::Signal(_) => ExitClass::Crash,
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            WorkerExit::Code(c) => Some(*c),
            WorkerExit::Signal(_) => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            WorkerExit::Signal(s) => Some(*s),
            WorkerExit::Code(_) => None,
        }
    }

    /// Human-readable signal name, falling back to the number.
    pub fn signal_name(&self) -> Option<String> {
        self.signal().map(|s| {
            nix::sys::signal::Signal::try_from(s)
                .map(|sig| sig.as_str().to_string())
                .unwrap_or_else(|_| s.to_string())
        })
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Code(code),
            (None, Some(signal)) => WorkerExit::Signal(signal),
            // Neither code nor signal only happens for stopped processes
            (None, None) => WorkerExit::Code(-1),
        }
    }
}

/// Renders as `code <c> and signal <s>`, with `null` for the missing half.
impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "null".to_string());
        let signal = self.signal_name().unwrap_or_else(|| "null".to_string());
        write!(f, "code {} and signal {}", code, signal)
    }
}

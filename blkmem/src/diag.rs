//! Diagnostic reporting
//!
//! The allocator never aborts because of misuse. Instead, every problem is
//! turned into a [Diagnostic] carrying the call site that caused it and
//! handed to a [DiagnosticSink]. Which sink is used is decided by whoever
//! constructs the allocator object; the default re-emits everything through
//! `tracing`.

use std::{fmt, panic::Location, sync::Arc};

use parking_lot::Mutex;
use tracing::Level;

use crate::error::MemError;

/// Source location of the caller of a public allocator function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Site {
    pub file: &'static str,
    pub line: u32,
}

impl Site {
    /// Location of whoever called the (`#[track_caller]`) function this is invoked in
    #[track_caller]
    #[inline]
    pub fn caller() -> Self {
        let loc = Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One diagnostic line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub site: Site,
    /// The error this diagnostic was created from, if any
    pub error: Option<MemError>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "[{}] ERROR: {}", self.site, self.message),
            Severity::Warning => write!(f, "[{}] WARNING: {}", self.site, self.message),
            Severity::Info => write!(f, "{}", self.message),
        }
    }
}

/// Receiver of allocator diagnostics
///
/// Emitting is fire-and-forget: a sink must not call back into the
/// allocator object that reported to it.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diag: &Diagnostic);
}

/// Sink forwarding every diagnostic to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diag: &Diagnostic) {
        match diag.severity {
            Severity::Error => tracing::event!(
                Level::ERROR,
                file = diag.site.file,
                line = diag.site.line,
                "{}",
                diag.message
            ),
            Severity::Warning => tracing::event!(
                Level::WARN,
                file = diag.site.file,
                line = diag.site.line,
                "{}",
                diag.message
            ),
            Severity::Info => tracing::event!(Level::INFO, "{}", diag.message),
        }
    }
}

/// Sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct CollectingSink {
    diags: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything collected so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diags.lock().clone()
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diags.lock())
    }

    pub fn errors(&self) -> Vec<MemError> {
        self.diags
            .lock()
            .iter()
            .filter_map(|d| d.error.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.diags.lock().is_empty()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic) {
        self.diags.lock().push(diag.clone());
    }
}

/// Handle on a shared sink, cloned into every allocator object
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("@sink", &(Arc::as_ptr(&self.sink) as *const ()))
            .finish()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink }
    }

    /// Report `err` as an error at `site` and hand it back for returning
    pub fn fail(&self, site: Site, err: MemError) -> MemError {
        self.sink.emit(&Diagnostic {
            severity: Severity::Error,
            site,
            message: err.to_string(),
            error: Some(err.clone()),
        });
        err
    }

    /// Warn about memory still held, attaching `err` for sinks that match on it
    pub fn leaked(&self, site: Site, message: impl Into<String>, err: MemError) {
        debug_assert!(matches!(err, MemError::Leaked { .. }));
        self.sink.emit(&Diagnostic {
            severity: Severity::Warning,
            site,
            error: Some(err),
            message: message.into(),
        });
    }

    pub fn error(&self, site: Site, message: impl Into<String>) {
        self.emit(Severity::Error, site, message.into());
    }

    pub fn warning(&self, site: Site, message: impl Into<String>) {
        self.emit(Severity::Warning, site, message.into());
    }

    pub fn info(&self, site: Site, message: impl Into<String>) {
        self.emit(Severity::Info, site, message.into());
    }

    fn emit(&self, severity: Severity, site: Site, message: String) {
        self.sink.emit(&Diagnostic {
            severity,
            site,
            error: None,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::UsizePtr;

    #[test]
    fn site_caller_points_here() {
        let site = Site::caller();
        assert_eq!(site.file, file!());
        assert_eq!(site.line, line!() - 2);
    }

    #[test]
    fn diagnostic_rendering() {
        let site = Site {
            file: "heur.c",
            line: 42,
        };
        let d = Diagnostic {
            severity: Severity::Error,
            site,
            error: Some(MemError::NullPointer),
            message: MemError::NullPointer.to_string(),
        };
        assert_eq!(d.to_string(), "[heur.c:42] ERROR: Tried to free null pointer.");

        let d = Diagnostic {
            severity: Severity::Warning,
            site,
            error: None,
            message: "Memory list not empty.".into(),
        };
        assert_eq!(d.to_string(), "[heur.c:42] WARNING: Memory list not empty.");

        let d = Diagnostic {
            severity: Severity::Info,
            site,
            error: None,
            message: "Total:           0".into(),
        };
        assert_eq!(d.to_string(), "Total:           0");
    }

    #[test]
    fn fail_reports_and_returns() {
        let sink = Arc::new(CollectingSink::new());
        let diag = Diagnostics::new(sink.clone());
        let err = diag.fail(
            Site::caller(),
            MemError::UnknownPointer {
                ptr: UsizePtr(0x10),
            },
        );
        assert_eq!(
            err,
            MemError::UnknownPointer {
                ptr: UsizePtr(0x10)
            }
        );
        assert_eq!(sink.errors(), vec![err]);
        let d = sink.take();
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].message, "Tried to free unknown pointer <0x10>.");
        assert!(sink.is_empty());
    }

    #[test]
    fn leak_warning_carries_error() {
        let sink = Arc::new(CollectingSink::new());
        let diag = Diagnostics::new(sink.clone());
        diag.leaked(
            Site::caller(),
            "Memory list not empty.",
            MemError::Leaked { bytes: 24, count: 2 },
        );
        assert_eq!(sink.errors(), vec![MemError::Leaked { bytes: 24, count: 2 }]);
        let d = sink.take();
        assert_eq!(d[0].severity, Severity::Warning);
        assert_eq!(d[0].message, "Memory list not empty.");
    }
}

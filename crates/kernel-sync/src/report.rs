/// User-visible failure reporting.
use tracing::error;

/// A transient, dismissible notice shown to the user.
#[derive(Debug, Clone)]
pub struct Notice {
    pub message: String,
}

/// Sink for notices. Implementations must not block and never re-throw;
/// reporting an error is terminal for that error.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, notice: Notice);
}

/// Default reporter that forwards notices to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, notice: Notice) {
        error!("{}", notice.message);
    }
}

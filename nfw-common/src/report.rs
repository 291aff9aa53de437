/// The error channel of the firewall. Every setup, verdict and receive failure is funneled
/// through an implementation of this trait.
///
/// Implementations are invoked synchronously from whichever thread hit the failure (the caller
/// during start, the worker afterwards), so they must be cheap and must never panic.
pub trait ErrorReporter: Send + Sync + 'static {
    /// Reports a failure of `operation`, with a human readable `message` and the platform error
    /// code (`0` when there is none).
    fn report(&self, operation: &str, message: &str, code: i32);
}

impl<F> ErrorReporter for F
where
    F: Fn(&str, &str, i32) + Send + Sync + 'static,
{
    fn report(&self, operation: &str, message: &str, code: i32) {
        self(operation, message, code)
    }
}

/// Default reporter, logs every failure as a `tracing` error event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, operation: &str, message: &str, code: i32) {
        if code != 0 {
            let os = std::io::Error::from_raw_os_error(code);
            tracing::error!(operation, code, %os, "{message}");
        } else {
            tracing::error!(operation, "{message}");
        }
    }
}

/// Reporter that swallows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, _operation: &str, _message: &str, _code: i32) {}
}

use std::fmt::Debug;

/// Logs the error side of a `Result` and keeps going.
///
/// Used on best-effort paths (audit records, DMs, cleanup) where a failure
/// must be visible in the logs but never abort the caller.
pub trait ForwardRefToTracing<T, E> {
    fn trace_err(self) -> Result<T, E>;
    fn trace_err_ok(self) -> Option<T>;
    /// Same as `trace_err_ok` but at warn level, for expected failures.
    fn warn_err_ok(self, context: &str) -> Option<T>;
}

impl<T, E> ForwardRefToTracing<T, E> for Result<T, E>
where
    E: Debug,
{
    fn trace_err(self) -> Result<T, E> {
        self.map_err(|e| {
            tracing::error!("{:?}", e);
            e
        })
    }

    fn trace_err_ok(self) -> Option<T> {
        self.trace_err().ok()
    }

    fn warn_err_ok(self, context: &str) -> Option<T> {
        self.map_err(|e| {
            tracing::warn!("{context}: {:?}", e);
            e
        })
        .ok()
    }
}

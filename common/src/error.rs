use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt::Debug,
    panic::Location,
};

use thiserror::Error;
use tracing::error;

/// For failures with nowhere to propagate to, like cleanup in `Drop` or a handler on a
/// worker thread
pub trait LogErrorExt {
    fn log_error(self, context: &str);
}

impl<T, E: Debug> LogErrorExt for Result<T, E> {
    #[track_caller]
    fn log_error(self, context: &str) {
        let Err(err) = self else {
            return;
        };

        let location = Location::caller();
        // Only when RUST_BACKTRACE asks for it, cleanup paths fail routinely
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            error!(%location, "{context}: {err:?}\n{backtrace}");
        } else {
            error!(%location, "{context}: {err:?}");
        }
    }
}

/// The kinds of failure the sdk surfaces to its callers
///
/// Lower layers return their own typed errors, the hardware layer wraps these in
/// `anyhow` so callers can `downcast_ref::<SdkError>()` to branch on the kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    /// Bad port, bad parameter schema or an out of range value
    #[error("Validation error: {0}")]
    Validation(String),
    /// Unexpected response id or a malformed line
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// I2C or SPI transfer failed
    #[error("Bus error: {0}")]
    Bus(String),
    /// Request/reply expired
    #[error("Timed out: {0}")]
    Timeout(String),
    /// An advisory lock is held by someone else
    #[error("Resource is in use: {0}")]
    Contention(String),
    /// A descriptor names a component nobody registered
    #[error("Could not reconstruct component: {0}")]
    Reconstruction(String),
}

impl SdkError {
    pub fn validation(message: impl Into<String>) -> Self {
        SdkError::Validation(message.into())
    }

    pub fn bus(message: impl Into<String>) -> Self {
        SdkError::Bus(message.into())
    }
}

/// Walks an `anyhow` chain looking for the sdk error kind that caused it
pub fn kind_of(err: &anyhow::Error) -> Option<&SdkError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SdkError>())
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use anyhow::Context;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logged(op: impl FnOnce()) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, op);

        let output = captured.0.lock().unwrap().clone();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn failures_logged_at_caller() {
        let output = logged(|| {
            Err::<(), _>(SdkError::bus("I2C write failed")).log_error("Stop motor");
        });

        assert!(output.contains("ERROR"));
        assert!(output.contains(r#"Stop motor: Bus("I2C write failed")"#));
        assert!(output.contains("location="), "{output}");
        assert!(output.contains("error.rs:"), "{output}");
    }

    #[test]
    fn success_is_silent() {
        let output = logged(|| Ok::<_, SdkError>(()).log_error("Stop motor"));
        assert!(output.is_empty());
    }

    #[test]
    fn kind_survives_context() {
        let res: anyhow::Result<()> = Err(SdkError::validation("Port Z9 does not exist").into());
        let err = res.context("Create led").unwrap_err();

        assert!(matches!(kind_of(&err), Some(SdkError::Validation(_))));
    }

    #[test]
    fn kind_missing() {
        let err = anyhow::anyhow!("Something else");
        assert_eq!(kind_of(&err), None);
    }
}

//! Error primitives shared across the crate.
//!
//! Components with a well-defined failure surface (sender registration, container lookups, configuration) expose
//! their own `snafu` error enums. Everything else, where the caller only needs to log or propagate the failure, uses
//! [`GenericError`].
use std::fmt::Display;

/// A type-erased error.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (as with `std::format!`), or any value implementing
/// `Debug` and `Display`, such as an existing error.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::error::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::error::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::error::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Extension methods for attaching context to a fallible result.
///
/// This wraps `anyhow::Context` so that it does not collide with `snafu::ResultExt` when both are in scope.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error value with additional context, evaluated only if an error occurred.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_prepended_to_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk on fire"));
        let err = result.error_context("Failed to write checkpoint.").unwrap_err();

        assert_eq!(err.to_string(), "Failed to write checkpoint.");
        assert_eq!(err.root_cause().to_string(), "disk on fire");
    }

    #[test]
    fn generic_error_formats_arguments() {
        let err = generic_error!("shard {} unavailable", 3);
        assert_eq!(err.to_string(), "shard 3 unavailable");
    }
}

//! Error-context helpers on `Result` and `Option`, plus `ensure!`.

use crate::error::{Error, Result};

/// Lazily attach a message to a failed `Result`, converting its error into
/// the crate [`Error`].
pub trait Context<T> {
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// Lookups (texture entries, slots, skins) that come back empty.
pub trait OptionContext<T> {
    /// `None` becomes [`Error::SourceUnavailable`] naming what was missing.
    fn or_unavailable<C, F>(self, what: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn or_unavailable<C, F>(self, what: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::source_unavailable(what()))
    }
}

/// Return a formatted [`Error::Custom`] unless `$cond` holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::error::Error::format(format_args!($($arg)+)));
        }
    };
}

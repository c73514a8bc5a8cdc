//! Logging setup and helpers.
//!
use std::iter::successors;

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, Layer, fmt::format::FmtSpan, layer::SubscriberExt};

/// Iterate over the `Display` representations of the sources of the given error
/// by recursively calling `std::error::Error::source()`.
pub fn iter_sources<T: std::error::Error>(
    error: &T,
) -> impl std::iter::Iterator<Item = String> + use<'_, T> {
    successors(error.source(), |&error| error.source()).map(ToString::to_string)
}

/// The full chain of an error, `outer | inner | innermost`.
pub fn error_chain<T: std::error::Error>(error: &T) -> String {
    std::iter::once(error.to_string())
        .chain(iter_sources(error))
        .collect::<Vec<_>>()
        .join(SEP)
}

/// Alias for `tracing::Level::ERROR`.
pub const ERROR: tracing::Level = tracing::Level::ERROR;

/// Alias for `tracing::Level::WARN`.
pub const WARN: tracing::Level = tracing::Level::WARN;

/// Default separator used by `log_error` to format error sources.
pub const SEP: &str = " | ";

/// Emit an event (ERROR unless a level is given) for an error, with fields
/// for its `Display` and `Debug` forms and its chain of sources.
///
/// ```no_run
/// use redsocial_init::utils::o11y::{log_error, WARN};
/// use std::io::{Error, ErrorKind};
///
/// let error = Error::new(ErrorKind::Other, "borked");
///
/// log_error!(error);
/// log_error!(error, "provisioning failed");
/// log_error!(WARN, error, "step {} failed", 3);
/// ```
#[macro_export]
macro_rules! log_error {
    // NOTE: The order of the patterns matters, don't scramble them.

    // Error + Format string + args
    ($error:expr, $fmt:literal, $($arg:tt)*) => {
        tracing::event!(
            $crate::utils::o11y::ERROR,
            error = %$error,
            source = %$crate::utils::o11y::iter_sources(&$error).collect::<Vec<_>>().join($crate::utils::o11y::SEP),
            debug = ?$error,
            $fmt,
            $($arg)*
        )
    };

    // Level + Error + Format string + args
    ($lvl:expr, $error:expr, $fmt:literal, $($arg:tt)*) => {
        tracing::event!(
            $lvl,
            error = %$error,
            source = %$crate::utils::o11y::iter_sources(&$error).collect::<Vec<_>>().join($crate::utils::o11y::SEP),
            debug = ?$error,
            $fmt,
            $($arg)*
        )
    };

    // Error + Message string
    ($error:expr, $msg:literal) => {
        tracing::event!(
            $crate::utils::o11y::ERROR,
            error = %$error,
            source = %$crate::utils::o11y::iter_sources(&$error).collect::<Vec<_>>().join($crate::utils::o11y::SEP),
            debug = ?$error,
            $msg
        )
    };

    // Error
    ($error:expr) => {
        tracing::event!(
            $crate::utils::o11y::ERROR,
            error = %$error,
            source = %$crate::utils::o11y::iter_sources(&$error).collect::<Vec<_>>().join($crate::utils::o11y::SEP),
            debug = ?$error
        )
    };
}

pub use log_error;

/// The error type returned when building a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum BuildSubscriberError {
    #[error("failed to parse filtering directive")]
    Parse(#[from] tracing_subscriber::filter::ParseError),
}

/// Span events requested through `RUST_LOG_SPAN_EVENTS`, e.g. `new,close`.
pub fn parse_span_events(value: &str) -> Option<FmtSpan> {
    value
        .split(',')
        .filter_map(|part| match part.trim().to_lowercase().as_str() {
            "new" => Some(FmtSpan::NEW),
            "enter" => Some(FmtSpan::ENTER),
            "exit" => Some(FmtSpan::EXIT),
            "close" => Some(FmtSpan::CLOSE),
            "none" => Some(FmtSpan::NONE),
            "active" => Some(FmtSpan::ACTIVE),
            "full" => Some(FmtSpan::FULL),
            _ => None,
        })
        .reduce(|lhs, rhs| lhs | rhs)
}

/// Build the subscriber used by the binary: a fmt layer filtered by
/// `RUST_LOG` (default `info`).
pub fn build_subscriber() -> Result<impl Subscriber, BuildSubscriberError> {
    let mut fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    if let Some(kind) = std::env::var("RUST_LOG_SPAN_EVENTS")
        .ok()
        .and_then(|value| parse_span_events(&value))
    {
        fmt_layer = fmt_layer.with_span_events(kind);
    }

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    Ok(tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter)))
}

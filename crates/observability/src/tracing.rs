//! Tracing/logging initialization.
//!
//! Output format is chosen by `LOG_FORMAT` (`json`, the default, or `pretty`);
//! filtering follows `RUST_LOG` and falls back to `info`. Audit records are
//! emitted on the `audit` target and can be routed with a filter directive such
//! as `RUST_LOG=info,audit=info`.

use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Parse a `LOG_FORMAT` value. Unknown values fall back to JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }
}

/// Initialize tracing/logging for the process using `LOG_FORMAT` and `RUST_LOG`.
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Initialize tracing/logging with an explicit format.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(true).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("PRETTY")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some("xml")), LogFormat::Json);
    }

    #[test]
    fn init_is_idempotent() {
        init_with(LogFormat::Json);
        init_with(LogFormat::Pretty);
    }
}

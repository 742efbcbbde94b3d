//! Tracing subscriber bootstrap.
//!
//! The db layer logs through the `log` facade; those records are bridged
//! into tracing so a single subscriber sees everything.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    #[default]
    Text,
}

/// Installs the global subscriber. `RUST_LOG` controls levels and
/// defaults to `info`. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        if let Err(e) = tracing_log::LogTracer::init() {
            eprintln!("log bridge already installed: {}", e);
        }

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);

        let result = match format {
            LogFormat::Json => {
                tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
            }
            LogFormat::Text => {
                tracing::subscriber::set_global_default(registry.with(fmt::layer()))
            }
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {}", e);
        }
    });
}

/// Span for one upgrade workflow step.
#[must_use]
pub fn upgrade_span(operation: &'static str, upgrade_id: i64) -> Span {
    tracing::info_span!("upgrade", op = operation, upgrade_id = upgrade_id)
}

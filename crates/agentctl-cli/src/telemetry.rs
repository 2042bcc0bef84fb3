//! Tracing bootstrap.
//!
//! The plain formatter is the default. Setting
//! `OTEL_EXPORTER_OTLP_ENDPOINT` switches to JSON span output suitable
//! for a collector sidecar; unset means no export anywhere.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

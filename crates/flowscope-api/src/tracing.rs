//! Tracing subscriber setup

use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber. `level` is the base level; `RUST_LOG`
/// style directives can refine it. SQL query logs stay at warn unless
/// explicitly requested.
pub fn init_tracing(level: &str, log_sql_queries: bool) {
    let base = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::new(base.to_string());
    if !log_sql_queries {
        match "sqlx=warn".parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("failed to set sqlx log filter: {e}"),
        }
    }

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // A subscriber is already installed (tests, embedding shell)
        tracing::debug!("tracing subscriber already set");
    }
}

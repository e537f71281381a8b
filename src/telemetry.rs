use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Initialize tracing subscribers and output. The invoker never calls this itself, it exists so
/// that consumers and tests have an easy way to see heartbeat logs. Filtering follows `RUST_LOG`,
/// defaulting to `info`. Safe to call repeatedly.
pub fn telemetry_init() {
    TRACING_INIT.get_or_init(|| {
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_default();
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        // Someone else may have installed a global subscriber already, which is fine
        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .try_init();
    });
}

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the tracing subscriber for hosts and tests.
///
/// Filter comes from `VIKINGBASE_LOG`, defaulting to crate-level info with
/// quiet sqlx. Safe to call more than once; only the first call installs
/// the subscriber.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                std::env::var("VIKINGBASE_LOG")
                    .unwrap_or_else(|_| "vikingbase=info,sqlx=warn".into()),
            )
            .with_target(true)
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .try_init();
    });
}

//! Shared helpers for reconciliation scenario tests.

use std::sync::Once;
use std::time::Duration;

use tether_core::resource::{AttachmentSet, ChildRef};
use tether_core::retry::RetryPolicy;

static INIT: Once = Once::new();

/// Initialize tracing once for the whole test binary.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tether_core=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Retry policy with a backoff short enough for tests.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(2))
}

pub fn server(id: i64) -> ChildRef {
    ChildRef::Server { id }
}

pub fn set(children: Vec<ChildRef>) -> AttachmentSet {
    children.into_iter().collect()
}

//! Tracing subscriber setup.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Install a fmt subscriber filtered by `ISG_LOG`
/// (e.g. `ISG_LOG=isg_core::indexer=debug,isg_core::mutation=info`).
///
/// Falls back to `isg_core=info`. Safe to call more than once, and a no-op
/// when the host process already installed a global subscriber.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env("ISG_LOG").unwrap_or_else(|_| EnvFilter::new("isg_core=info"));

        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .with(filter)
            .try_init();
    });
}

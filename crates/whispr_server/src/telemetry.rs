use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber: JSON formatting plus an
/// `EnvFilter` defaulting to `info` when `RUST_LOG` is unset. Safe to call
/// more than once per process (e.g. from multiple test modules) — only the
/// first call takes effect.
pub fn init_tracing(name: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);
        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
            .unwrap_or_else(|err| eprintln!("failed to install tracing subscriber for {name}: {err}"));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing("test");
        init_tracing("test");
    }
}

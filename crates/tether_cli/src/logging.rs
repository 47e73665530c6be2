use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
#[error("tracing has already been initialised")]
pub struct AlreadyInitialised;

/// Installs the global subscriber. Logs go to stderr so stdout carries only
/// the experiment summary. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() -> Result<(), AlreadyInitialised> {
    INITIALISED.set(()).map_err(|_| AlreadyInitialised)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
    Ok(())
}

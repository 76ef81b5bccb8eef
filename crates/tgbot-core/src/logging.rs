use std::env;

use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::Config, Result};

/// Initialize tracing for a service embedding the finisher.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(service_name: &str) -> Result<()> {
    init_with_filter(service_name, None)
}

/// [`init_with_filter`] with the filter from [`Config::log_filter`].
pub fn init_from_config(service_name: &str, cfg: &Config) -> Result<()> {
    init_with_filter(service_name, cfg.log_filter.as_deref())
}

/// Like [`init`], with a fallback filter used when `RUST_LOG` is unset.
pub fn init_with_filter(service_name: &str, fallback: Option<&str>) -> Result<()> {
    let rust_log = env::var("RUST_LOG").ok();
    let directives = filter_directives(service_name, fallback, rust_log.as_deref());

    // A subscriber installed earlier (tests, host application) wins.
    let _ = fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(false)
        .with_ansi(true)
        .try_init();

    Ok(())
}

/// Filter directives in priority order: `RUST_LOG`, then the configured fallback,
/// then info for our crates and warn for everything else.
fn filter_directives(service_name: &str, fallback: Option<&str>, rust_log: Option<&str>) -> String {
    [rust_log, fallback]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("warn,tgbot_core=info,{service_name}=info"))
}

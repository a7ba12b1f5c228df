use pmoconfig::Config;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Installe le subscriber tracing
///
/// `RUST_LOG` prime ; à défaut le niveau vient de `host.logger.min_level`.
/// La sortie console peut être coupée par `host.logger.enable_console`.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.get_log_min_level().to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let enable_console = config.get_log_enable_console().unwrap_or(true);

    let subscriber = Registry::default().with(filter);
    if enable_console {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    } else {
        subscriber.init();
    }
}

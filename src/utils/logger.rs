use std::sync::Once;

static INIT: Once = Once::new();

/// Install the `env_logger` backend once. `RUST_LOG` overrides the default
/// `info` filter. Safe to call repeatedly.
pub fn init_logging() {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or("info");
        if env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .try_init()
            .is_err()
        {
            log::debug!("logger already installed by the host process");
        }
    });
}

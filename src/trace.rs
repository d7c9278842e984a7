//! Logging setup (§10.1): `tracing` + `tracing-subscriber`, the same pair the rest of
//! this lineage uses for leveled, span-aware logs. No OTel exporter here — there is no
//! trace-collection endpoint in this system, just stderr.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Map `-v` occurrence count (or explicit `-v=N`) to a default log level. `RUST_LOG`
/// still takes precedence when set, so this only supplies the default.
fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `verbosity` is the CLI's `-v` occurrence count; it
/// only sets the *default* filter directive, so an explicit `RUST_LOG` always wins.
pub fn init(verbosity: u8) {
    let default_directive = level_for_verbosity(verbosity);
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_directive));

    tracing_subscriber::Registry::default()
        .with(tracing_subscriber::fmt::Layer::new())
        .with(filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_the_documented_levels() {
        assert_eq!(level_for_verbosity(0), "warn");
        assert_eq!(level_for_verbosity(1), "info");
        assert_eq!(level_for_verbosity(2), "debug");
        assert_eq!(level_for_verbosity(3), "trace");
        assert_eq!(level_for_verbosity(9), "trace");
    }
}

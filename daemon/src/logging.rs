//! Log setup. The original logs via syslog by default and to stdout when
//! `-vv/--logstdout` is given; we only target stdout here (see `DESIGN.md`
//! for why syslog-by-default isn't implemented) but keep the same
//! level/format split: `-vv` widens the default filter from `info` to
//! `debug` in addition to switching the sink.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `logstdout` only affects verbosity here
/// (stdout is always the sink); see the module doc.
pub fn init(logstdout: bool) {
    let default_directive = if logstdout { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

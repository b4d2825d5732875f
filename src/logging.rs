//! `tracing-subscriber` initializer for binaries, examples, and tests that
//! embed this crate, mirroring the `registry()` + `EnvFilter` + `fmt`
//! composition used elsewhere in this codebase's node entrypoints.

use tracing_subscriber::prelude::*;

/// Installs a global subscriber honoring `RUST_LOG`, defaulting to `info`
/// with this crate's components at `debug` when unset.
pub fn init() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,swarm_net=debug"));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .try_init();
}

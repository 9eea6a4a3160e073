//! Logging and tracing configuration
//!
//! Structured logging through the `tracing` crate. Call `logging::init()`
//! once at startup.
//!
//! # Log Levels
//!
//! - `error` - Mount failures reported by the front end
//! - `warn`  - Recoverable oddities (ignored El Torito entries, CHD prefetch
//!   disabled, cooked reads of audio sectors)
//! - `info`  - Mount and unmount results (default in release)
//! - `debug` - Parse steps and geometry detection (default in debug builds)
//! - `trace` - Per-sector and per-hunk detail
//!
//! # Environment Variable Control
//!
//! ```bash
//! RUST_LOG=debug imgmount disc.cue
//! RUST_LOG=imgmount::disk=trace imgmount hdd.img
//! RUST_LOG=imgmount::trackfile::hunk_cache=trace,imgmount::cdrom=info imgmount game.chd
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging/tracing system
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("imgmount=debug")
        } else {
            EnvFilter::new("imgmount=info")
        }
    });

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .compact(),
    );

    // Ignore an already installed subscriber
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Initialize logging with file:line and thread ids; the CHD prefetch
/// worker shows up as its own thread
pub fn init_verbose() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .pretty(),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Check if debug logging is enabled
#[inline]
pub fn is_debug_enabled() -> bool {
    tracing::enabled!(Level::DEBUG)
}

/// Check if trace logging is enabled
#[inline]
pub fn is_trace_enabled() -> bool {
    tracing::enabled!(Level::TRACE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info};

    #[test]
    fn test_init_twice() {
        init();
        init();
        info!("Test log message");
        debug!(drive = 'D', "Structured log");
        let _ = is_debug_enabled() || is_trace_enabled();
    }
}

//! SHARP relay allocation core (lib.rs)
//!
//! Server-side state for TURN-style relaying: relayed transport addresses
//! bound per client session, per-peer permissions with expiry, permission
//! checked data relay, and time-driven reclamation of expired state.

#![warn(clippy::all)]

pub mod allocator;
pub mod config;

// Re-export main types
pub use allocator::{
    run_collector, Addr, AllocationInfo, AllocationOptions, Allocator, AllocatorError,
    AllocatorResult, AllocatorStatsSnapshot, FiveTuple, PeerHandler, Permission, PortAllocator,
    PortError, Proto,
};
pub use config::RelayConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Example
/// ```
/// sharp_relay::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of some dependencies
    for directive in ["tokio=warn", "runtime=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        )
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging("debug");
        init_logging("info");
    }
}

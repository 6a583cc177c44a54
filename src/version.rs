//! Crate version helpers and compile-time metadata.

/// Crate semantic version from Cargo.toml.
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate semantic version (e.g., `"0.1.0"`).
#[inline]
pub fn version() -> &'static str {
    CRATE_VERSION
}

/// Returns a concise User-Agent string, e.g. `strand-rpc/0.1.0`.
pub fn user_agent() -> String {
    format!("strand-rpc/{CRATE_VERSION}")
}

//! Build-time information (version, commit, build time).
//!
//! Commit, build time, and toolchain are injected by the build script;
//! CI overrides them via `RUNNERSET_COMMIT` / `RUNNERSET_BUILD_TIME`.

/// Application version, from the crate manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short git commit hash, or "unknown" outside a git checkout.
pub const COMMIT: &str = env!("RUNNERSET_COMMIT");

/// Build timestamp (e.g. "2026-08-02T12:34:56Z").
pub const BUILD_TIME: &str = env!("RUNNERSET_BUILD_TIME");

/// Toolchain that produced the binary (e.g. "rustc 1.78.0").
pub const RUSTC_VERSION: &str = env!("RUNNERSET_RUSTC_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_info_is_populated() {
        assert!(!VERSION.is_empty());
        assert!(!COMMIT.is_empty());
        assert!(!BUILD_TIME.is_empty());
        assert!(!RUSTC_VERSION.is_empty());
    }
}

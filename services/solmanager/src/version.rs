//! Version tuples reported in status responses and stats objects.

pub use sol_core::{SDK_VERSION, SOL_VERSION};

/// This gateway's own version as `[major, minor, patch, build]`.
///
/// Derived from the crate version; the build component is always 0.
pub fn solmanager_version() -> [u32; 4] {
    let mut out = [0u32; 4];
    for (i, part) in env!("CARGO_PKG_VERSION").split('.').take(3).enumerate() {
        out[i] = part.parse().unwrap_or(0);
    }
    out
}

/// Render a version 4-tuple as a dotted string, e.g. `1.2.0.0`.
pub fn render(v: [u32; 4]) -> String {
    format!("{}.{}.{}.{}", v[0], v[1], v[2], v[3])
}

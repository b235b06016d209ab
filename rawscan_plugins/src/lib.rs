mod deflate;

pub use deflate::{
    inflate_raw_file, DeflateDecompressor, BLOCK_SIZE as DEFLATE_BLOCK_SIZE,
    DESCRIPTION as DEFLATE_DESCRIPTION, EXTENSION as DEFLATE_EXTENSION,
    MIN_DECOMP_SIZE as DEFLATE_MIN_DECOMP_SIZE,
};

use rawscan_core::{Decompressor, PluginRegistry};

/// Registry holding every bundled decompressor.
///
/// Called by the CLI at startup; library users can register extra
/// decompressors on the returned value before building a scanner.
pub fn default_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register("deflate", || Ok(Box::new(DeflateDecompressor::new())));
    registry
}

/// Resolve a bundled decompressor by name.
pub fn decompressor_by_name(name: &str) -> anyhow::Result<Box<dyn Decompressor>> {
    default_registry().create(name)
}

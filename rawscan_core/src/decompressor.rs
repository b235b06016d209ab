use std::collections::BTreeMap;

use crate::extract::ExtractionRule;

/// Validation oracle for one kind of raw compressed stream.
///
/// Each `Decompressor` implementation:
/// - Declares a fixed window width (`block_size`). The scanner hands it that
///   many bytes starting at every candidate offset, and the block reader
///   carries the same number of lookahead bytes past each block's useful end.
///   Windows are shorter only when they run into end of stream.
/// - Reports the measured decompressed size of a window, or `None` when the
///   window does not begin a valid stream. `None` is never an error.
/// - Is opened once per run and dropped once, after the last file.
pub trait Decompressor: Send {
    /// Registry name, e.g. `"deflate"`.
    fn name(&self) -> &'static str;

    /// Width of the test window in bytes.
    fn block_size(&self) -> usize;

    /// Smallest measured size that counts as a match.
    fn min_decomp_size(&self) -> u64;

    /// Human-readable label prefixed to every match description.
    fn description(&self) -> &'static str;

    /// Validate a single window of at most `block_size()` bytes.
    ///
    /// Returns the decompressed size measured from the window, or `None`
    /// when the bytes are not a plausible stream start. A short window is
    /// all that is left of the stream; when it is too short to decide,
    /// return `None`.
    fn validate(&mut self, window: &[u8]) -> Option<u64>;

    /// Cheap pre-filter consulted before [`validate`](Self::validate).
    ///
    /// Must only return `false` for windows `validate` would also reject, so
    /// the set of reported matches is the same with or without it.
    fn may_start_at(&self, _window: &[u8]) -> bool {
        true
    }

    /// Extraction rule this decompressor contributes when extraction is on.
    fn extraction_rule(&self) -> Option<ExtractionRule> {
        None
    }
}

type Factory = Box<dyn Fn() -> anyhow::Result<Box<dyn Decompressor>> + Send + Sync>;

/// Name → factory table of available decompressors.
///
/// A factory error is the "oracle failed to initialize" case: the caller
/// must abort the run before any file is read.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any earlier entry.
    pub fn register<F>(&mut self, name: &'static str, factory: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Decompressor>> + Send + Sync + 'static,
    {
        self.factories.insert(name, Box::new(factory));
        self
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate the decompressor registered under `name`.
    pub fn create(&self, name: &str) -> anyhow::Result<Box<dyn Decompressor>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            let known: Vec<_> = self.names().collect();
            anyhow::anyhow!(
                "unknown decompressor '{}'. Valid options: {}",
                name,
                known.join(", ")
            )
        })?;
        let plugin = factory()
            .map_err(|e| e.context(format!("failed to initialize decompressor '{}'", name)))?;
        log::info!(
            "loaded decompressor '{}' (window {} bytes, min size {})",
            plugin.name(),
            plugin.block_size(),
            plugin.min_decomp_size()
        );
        Ok(plugin)
    }
}

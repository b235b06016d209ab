use std::path::PathBuf;

/// Default number of useful bytes per block read: 1 MB.
pub const DEFAULT_READ_BLOCK_SIZE: usize = 1024 * 1024;

/// Default decompressor selected when the scan is enabled.
pub const DEFAULT_DECOMPRESSOR: &str = "deflate";

/// Run-wide scan settings, built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Master switch. A disabled scanner opens no plugin and reads no file.
    pub enabled: bool,
    /// Registry name of the decompressor to scan with.
    pub decompressor: String,
    /// Useful bytes per block read. The lookahead is the decompressor's
    /// window width and is not configured here.
    pub read_block_size: usize,
    /// Absolute offset to start scanning each file at.
    pub offset: u64,
    /// Bytes to scan per file, `None` for everything up to EOF.
    pub length: Option<u64>,
    /// Run extraction rules on matches.
    pub extract: bool,
    /// Parent of each `_<file>.extracted` directory; `None` means next to the file.
    pub extract_dir: Option<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            decompressor: DEFAULT_DECOMPRESSOR.to_string(),
            read_block_size: DEFAULT_READ_BLOCK_SIZE,
            offset: 0,
            length: None,
            extract: false,
            extract_dir: None,
        }
    }
}

impl ScanConfig {
    /// Enabled configuration for the named decompressor.
    pub fn with_decompressor(name: &str) -> Self {
        Self {
            enabled: true,
            decompressor: name.to_string(),
            ..Self::default()
        }
    }
}

pub mod block_reader;
pub mod config;
pub mod decompressor;
pub mod extract;
pub mod progress;
pub mod scanner;

pub use block_reader::{Block, BlockReader};
pub use config::{ScanConfig, DEFAULT_READ_BLOCK_SIZE};
pub use decompressor::{Decompressor, PluginRegistry};
pub use extract::{ExtractCommand, ExtractionRule, Extractor};
pub use progress::Progress;
pub use scanner::{scan_block, FileReport, Match, NullObserver, ScanObserver, Scanner};

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::block_reader::{Block, BlockReader};
use crate::config::ScanConfig;
use crate::decompressor::{Decompressor, PluginRegistry};
use crate::extract::Extractor;
use crate::progress::Progress;

/// A window the oracle validated at or above the minimum size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    /// Absolute offset in the scanned file.
    pub offset: u64,
    pub description: String,
    /// Decompressed size measured by the oracle.
    pub size: u64,
}

/// Test every useful offset of `block` against `oracle`.
///
/// Each index `i` in `0..block.dlen` is handed the window
/// `block.data[i..i + oracle.block_size()]`; the lookahead past `dlen` is what
/// keeps those windows full width near the end of the block. Only the last
/// windows before end of stream are clipped to the bytes that remain. Hits at
/// or above `oracle.min_decomp_size()` are passed to `emit` in offset order.
/// Adjacent hits are reported as they come; nothing is merged.
pub fn scan_block(block: &Block<'_>, oracle: &mut dyn Decompressor, mut emit: impl FnMut(Match)) {
    let width = oracle.block_size();
    let min_size = oracle.min_decomp_size();

    for i in 0..block.dlen {
        let end = (i + width).min(block.data.len());
        let window = &block.data[i..end];
        if !oracle.may_start_at(window) {
            continue;
        }
        if let Some(size) = oracle.validate(window) {
            if size >= min_size {
                emit(Match {
                    offset: block.offset + i as u64,
                    description: format!(
                        "{}, uncompressed size >= {}",
                        oracle.description(),
                        size
                    ),
                    size,
                });
            }
        }
    }
}

/// Receives results and progress while a run is in flight.
///
/// Every method has a no-op default.
pub trait ScanObserver {
    fn on_file_start(&mut self, _path: &Path, _total: u64) {}
    fn on_match(&mut self, _path: &Path, _m: &Match) {}
    fn on_progress(&mut self, _path: &Path, _progress: &Progress) {}
    fn on_file_end(&mut self, _report: &FileReport) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl ScanObserver for NullObserver {}

/// Outcome of scanning a single file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub matches: Vec<Match>,
    /// Useful bytes scanned; equals the file's scan length on success.
    pub scanned: u64,
    /// Carved files written by extraction rules.
    pub extracted: Vec<PathBuf>,
    pub extraction_failures: usize,
    /// Set when the file could not be read to the end.
    pub error: Option<String>,
}

/// Runs one decompressor over a sequence of files.
///
/// The decompressor is created in [`Scanner::new`] and dropped with the
/// scanner, so it is opened and released exactly once per run regardless
/// of how many files are scanned or fail.
pub struct Scanner {
    config: ScanConfig,
    oracle: Option<Box<dyn Decompressor>>,
    extractor: Extractor,
}

impl Scanner {
    /// Build a scanner from `config`, instantiating its decompressor.
    ///
    /// Errors here are fatal: an unknown decompressor or one that fails to
    /// initialize aborts the run before any file is opened. A disabled
    /// config yields a scanner that scans nothing.
    pub fn new(config: ScanConfig, registry: &PluginRegistry) -> anyhow::Result<Self> {
        if config.read_block_size == 0 {
            anyhow::bail!("read block size must be non-zero");
        }

        let mut extractor = Extractor::new(config.extract_dir.clone());
        let oracle = if config.enabled {
            let oracle = registry.create(&config.decompressor)?;
            if config.extract {
                if let Some(rule) = oracle.extraction_rule() {
                    extractor.add_rule(rule);
                }
            }
            Some(oracle)
        } else {
            log::debug!("raw compression scan disabled");
            None
        };

        Ok(Self {
            config,
            oracle,
            extractor,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.oracle.is_some()
    }

    /// Extraction rules in effect; callers may register more before scanning.
    pub fn extractor_mut(&mut self) -> &mut Extractor {
        &mut self.extractor
    }

    /// Scan `paths` in order.
    ///
    /// A file that cannot be opened or read is logged and reported with its
    /// `error` set; the remaining files are still scanned.
    pub fn scan_files<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        observer: &mut dyn ScanObserver,
    ) -> Vec<FileReport> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let mut reports = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let report = match self.scan_file(path, observer) {
                Ok(report) => report,
                Err(e) => {
                    log::error!("skipping {:?}: {:#}", path, e);
                    let report = FileReport {
                        path: path.to_path_buf(),
                        error: Some(format!("{:#}", e)),
                        ..FileReport::default()
                    };
                    observer.on_file_end(&report);
                    report
                }
            };
            reports.push(report);
        }
        reports
    }

    /// Scan a single file from `config.offset` for `config.length` bytes.
    pub fn scan_file(
        &mut self,
        path: &Path,
        observer: &mut dyn ScanObserver,
    ) -> anyhow::Result<FileReport> {
        let Some(oracle) = self.oracle.as_deref_mut() else {
            anyhow::bail!("raw compression scan is not enabled");
        };

        let mut reader = BlockReader::open(path, self.config.offset, self.config.length)?;
        reader.configure(self.config.read_block_size, oracle.block_size())?;

        let start = reader.start();
        let mut progress = Progress::new(reader.total());
        let mut report = FileReport {
            path: path.to_path_buf(),
            ..FileReport::default()
        };

        log::debug!(
            "scanning {:?}: {} bytes from offset {} with '{}'",
            path,
            progress.total,
            start,
            oracle.name()
        );
        observer.on_file_start(path, progress.total);

        let mut reported = false;
        loop {
            let block = reader.read_block()?;
            if block.is_empty() {
                break;
            }

            let mut found = Vec::new();
            scan_block(&block, oracle, |m| found.push(m));

            for m in found {
                log::trace!("{:?} @ {}: {}", path, m.offset, m.description);
                observer.on_match(path, &m);
                if self.config.extract {
                    match self.extractor.extract(path, m.offset, &m.description) {
                        Ok(Some(carved)) => report.extracted.push(carved),
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!(
                                "extraction failed for {:?} at offset {}: {:#}",
                                path,
                                m.offset,
                                e
                            );
                            report.extraction_failures += 1;
                        }
                    }
                }
                report.matches.push(m);
            }

            if progress.advance(reader.tell() - start) {
                observer.on_progress(path, &progress);
                reported = true;
            }
        }

        // An empty range never advances; observers still see it complete.
        if !reported {
            observer.on_progress(path, &progress);
        }

        report.scanned = progress.completed;
        log::debug!(
            "finished {:?}: {} matches in {} bytes",
            path,
            report.matches.len(),
            report.scanned
        );
        observer.on_file_end(&report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAGIC: &[u8; 4] = b"RAWZ";
    const WIDTH: usize = 12;

    /// Accepts windows starting with `RAWZ` followed by a little-endian
    /// u32 size.
    struct Marker {
        calls: usize,
    }

    impl Decompressor for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }
        fn block_size(&self) -> usize {
            WIDTH
        }
        fn min_decomp_size(&self) -> u64 {
            100
        }
        fn description(&self) -> &'static str {
            "Marker stream"
        }
        fn validate(&mut self, window: &[u8]) -> Option<u64> {
            self.calls += 1;
            assert!(window.len() <= WIDTH);
            if window.len() < 8 || &window[..4] != MAGIC {
                return None;
            }
            Some(u32::from_le_bytes(window[4..8].try_into().ok()?) as u64)
        }
    }

    fn with_marker(len: usize, at: usize, size: u32) -> Vec<u8> {
        let mut data = vec![0u8; len];
        data[at..at + 4].copy_from_slice(MAGIC);
        data[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
        data
    }

    fn scan_all(data: Vec<u8>, block_size: usize, oracle: &mut Marker) -> Vec<Match> {
        let mut reader = BlockReader::new(Cursor::new(data), 0, None).unwrap();
        reader.configure(block_size, oracle.block_size()).unwrap();
        let mut matches = Vec::new();
        loop {
            let block = reader.read_block().unwrap();
            if block.is_empty() {
                break;
            }
            scan_block(&block, oracle, |m| matches.push(m));
        }
        matches
    }

    #[test]
    fn reports_absolute_offset_and_description() {
        let mut oracle = Marker { calls: 0 };
        let matches = scan_all(with_marker(200, 70, 4096), 32, &mut oracle);
        assert_eq!(
            matches,
            vec![Match {
                offset: 70,
                description: "Marker stream, uncompressed size >= 4096".to_string(),
                size: 4096,
            }]
        );
    }

    #[test]
    fn every_offset_is_tested() {
        let mut oracle = Marker { calls: 0 };
        scan_all(vec![0u8; 200], 32, &mut oracle);
        assert_eq!(oracle.calls, 200);
    }

    #[test]
    fn windows_clip_only_at_end_of_stream() {
        struct Widths(Vec<usize>);

        impl Decompressor for Widths {
            fn name(&self) -> &'static str {
                "widths"
            }
            fn block_size(&self) -> usize {
                WIDTH
            }
            fn min_decomp_size(&self) -> u64 {
                0
            }
            fn description(&self) -> &'static str {
                "Widths"
            }
            fn validate(&mut self, window: &[u8]) -> Option<u64> {
                self.0.push(window.len());
                None
            }
        }

        let mut reader = BlockReader::new(Cursor::new(vec![0u8; 100]), 0, None).unwrap();
        reader.configure(16, WIDTH).unwrap();
        let mut oracle = Widths(Vec::new());
        loop {
            let block = reader.read_block().unwrap();
            if block.is_empty() {
                break;
            }
            scan_block(&block, &mut oracle, |_| {});
        }

        let widths = oracle.0;
        assert_eq!(widths.len(), 100);
        assert!(widths[..=100 - WIDTH].iter().all(|&w| w == WIDTH));
        assert_eq!(widths[100 - WIDTH + 1..], (1..WIDTH).rev().collect::<Vec<_>>()[..]);
    }

    #[test]
    fn hits_across_block_boundary() {
        // Starts 3 bytes before the end of the first 32-byte block.
        for at in 28..36 {
            let mut oracle = Marker { calls: 0 };
            let matches = scan_all(with_marker(100, at, 500), 32, &mut oracle);
            assert_eq!(matches.len(), 1, "at {at}");
            assert_eq!(matches[0].offset, at as u64);
        }
    }

    #[test]
    fn below_minimum_is_dropped() {
        let mut oracle = Marker { calls: 0 };
        assert!(scan_all(with_marker(100, 10, 99), 32, &mut oracle).is_empty());
    }

    #[test]
    fn nearby_hits_are_not_merged() {
        let mut data = with_marker(100, 10, 200);
        data[18..22].copy_from_slice(MAGIC);
        data[22..26].copy_from_slice(&300u32.to_le_bytes());
        let mut oracle = Marker { calls: 0 };
        let offsets: Vec<u64> = scan_all(data, 32, &mut oracle)
            .iter()
            .map(|m| m.offset)
            .collect();
        assert_eq!(offsets, vec![10, 18]);
    }

    #[test]
    fn disabled_scanner_scans_nothing() {
        let registry = PluginRegistry::new();
        let mut scanner = Scanner::new(ScanConfig::default(), &registry).unwrap();
        assert!(!scanner.is_enabled());
        let reports = scanner.scan_files(&["/does/not/exist"], &mut NullObserver);
        assert!(reports.is_empty());
    }

    #[test]
    fn zero_read_block_size_rejected() {
        let config = ScanConfig {
            read_block_size: 0,
            ..ScanConfig::default()
        };
        assert!(Scanner::new(config, &PluginRegistry::new()).is_err());
    }
}

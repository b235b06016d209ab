use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use rawscan_core::config::{DEFAULT_DECOMPRESSOR, DEFAULT_READ_BLOCK_SIZE};
use rawscan_core::{FileReport, Match, Progress, ScanConfig, ScanObserver, Scanner};
use rawscan_plugins::default_registry;

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "rawscan",
    about = "Scan binary images for embedded raw compressed streams",
    version
)]
struct Cli {
    /// Files to scan
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Scan for raw deflate compression streams
    #[arg(short = 'X', long)]
    deflate: bool,
    /// Decompressor to scan with when the scan is enabled
    #[arg(long, default_value = DEFAULT_DECOMPRESSOR)]
    decompressor: String,
    /// Extract matches with the decompressor's extraction rule
    #[arg(short, long)]
    extract: bool,
    /// Put each file's _<file>.extracted directory here instead of next to it
    #[arg(short = 'C', long)]
    directory: Option<PathBuf>,
    /// Start scanning at this file offset (decimal or 0x-prefixed hex)
    #[arg(short, long, default_value = "0", value_parser = parse_int)]
    offset: u64,
    /// Number of bytes to scan (default: to end of file)
    #[arg(short, long, value_parser = parse_int)]
    length: Option<u64>,
    /// Useful bytes per block read
    #[arg(short = 'K', long = "block", default_value_t = DEFAULT_READ_BLOCK_SIZE)]
    block_size: usize,
    /// Print one JSON object per match instead of a table
    #[arg(long)]
    json: bool,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            enabled: self.deflate,
            decompressor: self.decompressor.clone(),
            read_block_size: self.block_size,
            offset: self.offset,
            length: self.length,
            extract: self.extract,
            extract_dir: self.directory.clone(),
        }
    }

    fn log_level(&self) -> log::LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => log::LevelFilter::Warn,
            (false, 0) => log::LevelFilter::Info,
            (false, 1) => log::LevelFilter::Debug,
            (false, _) => log::LevelFilter::Trace,
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn parse_int(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

// ── Result output ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct MatchRecord<'a> {
    file: &'a Path,
    #[serde(flatten)]
    m: &'a Match,
}

/// Prints results as they arrive: a table per file, or JSON lines.
struct Printer<W: Write> {
    out: W,
    json: bool,
    failed: Option<io::Error>,
}

impl<W: Write> Printer<W> {
    fn new(out: W, json: bool) -> Self {
        Self {
            out,
            json,
            failed: None,
        }
    }

    fn emit(&mut self, f: impl FnOnce(&mut W, bool) -> io::Result<()>) {
        if self.failed.is_none() {
            if let Err(e) = f(&mut self.out, self.json) {
                self.failed = Some(e);
            }
        }
    }

    fn finish(mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        match self.failed {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl<W: Write> ScanObserver for Printer<W> {
    fn on_file_start(&mut self, path: &Path, total: u64) {
        log::debug!("{:?}: {} to scan", path, human_bytes(total));
        self.emit(|out, json| {
            if json {
                return Ok(());
            }
            writeln!(out)?;
            writeln!(out, "Target File:   {:?}", path)?;
            writeln!(out)?;
            writeln!(out, "{:<14}{:<16}{}", "DECIMAL", "HEXADECIMAL", "DESCRIPTION")?;
            writeln!(out, "{}", "-".repeat(80))
        });
    }

    fn on_match(&mut self, path: &Path, m: &Match) {
        self.emit(|out, json| {
            if json {
                let line = serde_json::to_string(&MatchRecord { file: path, m })
                    .map_err(io::Error::other)?;
                writeln!(out, "{}", line)
            } else {
                writeln!(
                    out,
                    "{:<14}{:<16}{}",
                    m.offset,
                    format!("0x{:X}", m.offset),
                    m.description
                )
            }
        });
    }

    fn on_progress(&mut self, path: &Path, progress: &Progress) {
        log::trace!(
            "{:?}: {} / {} ({:.1}%)",
            path,
            progress.completed,
            progress.total,
            progress.fraction() * 100.0
        );
    }

    fn on_file_end(&mut self, report: &FileReport) {
        if let Some(err) = &report.error {
            log::error!("{:?}: {}", report.path, err);
        }
        for carved in &report.extracted {
            log::info!("extracted {:?}", carved);
        }
        if report.extraction_failures > 0 {
            log::warn!(
                "{:?}: {} extraction(s) failed",
                report.path,
                report.extraction_failures
            );
        }
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .init();

    let config = cli.scan_config();
    if !config.enabled {
        log::warn!("no scan enabled; pass -X/--deflate to scan for raw deflate streams");
        return Ok(());
    }

    let registry = default_registry();
    let mut scanner = Scanner::new(config, &registry)?;

    let t0 = Instant::now();
    let mut printer = Printer::new(io::stdout().lock(), cli.json);
    let reports = scanner.scan_files(cli.files.as_slice(), &mut printer);
    printer.finish()?;
    let elapsed = t0.elapsed();

    let scanned: u64 = reports.iter().map(|r| r.scanned).sum();
    let matches: usize = reports.iter().map(|r| r.matches.len()).sum();
    let failed = reports.iter().filter(|r| r.error.is_some()).count();

    eprintln!();
    eprintln!("  files       : {}", reports.len());
    eprintln!("  scanned     : {}", human_bytes(scanned));
    eprintln!("  matches     : {}", matches);
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((scanned as f64 / elapsed.as_secs_f64().max(1e-9)) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());

    if failed > 0 {
        anyhow::bail!("{} of {} file(s) could not be scanned", failed, reports.len());
    }
    Ok(())
}

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use flate2::read::DeflateDecoder;
use flate2::{Decompress, FlushDecompress, Status};

use rawscan_core::extract::{prefix_pattern, strip_extension, ExtractCommand, ExtractionRule};
use rawscan_core::Decompressor;

/// Window width: enough compressed input that even stored blocks can prove
/// [`MIN_DECOMP_SIZE`].
pub const BLOCK_SIZE: usize = 33 * 1024;

/// Streams that inflate to less than this are treated as noise.
pub const MIN_DECOMP_SIZE: u64 = 32 * 1024;

pub const DESCRIPTION: &str = "Raw deflate compression stream";

/// Extension given to carved deflate streams.
pub const EXTENSION: &str = "deflate";

/// Scratch output size for validation; inflated bytes are counted, not kept.
const SCRATCH_SIZE: usize = 32 * 1024;

/// Raw (headerless) deflate oracle.
///
/// A full-width window validates when it inflates without error, either to
/// the end of the stream or to the end of the window; real streams routinely
/// run past the window, so truncation still counts. A window clipped by end
/// of file must hold a complete stream. The measured size is the number of
/// bytes produced.
pub struct DeflateDecompressor {
    inflater: Decompress,
    scratch: Box<[u8]>,
}

impl Default for DeflateDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeflateDecompressor {
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(false),
            scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
        }
    }

    /// Inflate `input` into the scratch buffer, returning the bytes produced.
    fn inflated_size(&mut self, input: &[u8]) -> Option<u64> {
        if input.is_empty() {
            return None;
        }
        self.inflater.reset(false);
        let mut in_pos = 0usize;

        loop {
            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();

            let status = self
                .inflater
                .decompress(&input[in_pos..], &mut self.scratch, FlushDecompress::None)
                .ok()?;

            let consumed = (self.inflater.total_in() - before_in) as usize;
            let produced = self.inflater.total_out() - before_out;
            in_pos += consumed;

            match status {
                Status::StreamEnd => return Some(self.inflater.total_out()),
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        // No progress: either the window ran out, or the
                        // inflater is stuck on input it cannot use.
                        return if in_pos >= input.len() && input.len() >= BLOCK_SIZE {
                            Some(self.inflater.total_out())
                        } else {
                            None
                        };
                    }
                }
            }
        }
    }
}

impl Decompressor for DeflateDecompressor {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn min_decomp_size(&self) -> u64 {
        MIN_DECOMP_SIZE
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn validate(&mut self, window: &[u8]) -> Option<u64> {
        self.inflated_size(window)
    }

    /// Rejects the two first-block headers the inflater refuses outright:
    /// the reserved block type, and a stored block whose LEN and NLEN
    /// fields are not complements.
    fn may_start_at(&self, window: &[u8]) -> bool {
        let Some(&first) = window.first() else {
            return false;
        };
        match (first >> 1) & 0b11 {
            0b11 => false,
            0b00 if window.len() >= 5 => {
                let len = u16::from_le_bytes([window[1], window[2]]);
                let nlen = u16::from_le_bytes([window[3], window[4]]);
                len == !nlen
            }
            _ => true,
        }
    }

    fn extraction_rule(&self) -> Option<ExtractionRule> {
        let pattern = prefix_pattern(DESCRIPTION);
        match ExtractionRule::new(&pattern, EXTENSION, ExtractCommand::builtin(inflate_raw_file)) {
            Ok(rule) => Some(rule),
            Err(e) => {
                log::warn!("deflate extraction rule unavailable: {:#}", e);
                None
            }
        }
    }
}

/// Inflate the raw deflate stream at the start of `path` into `path` with
/// its extension stripped. Trailing bytes after the end of the stream are
/// ignored.
pub fn inflate_raw_file(path: &Path) -> anyhow::Result<()> {
    let out_path = strip_extension(path);
    if out_path == path {
        anyhow::bail!("{:?} has no extension to strip", path);
    }

    let src = BufReader::new(File::open(path).with_context(|| format!("opening {:?}", path))?);
    let mut decoder = DeflateDecoder::new(src);
    let mut dst = BufWriter::new(
        File::create(&out_path).with_context(|| format!("creating {:?}", out_path))?,
    );
    let written = io::copy(&mut decoder, &mut dst)
        .with_context(|| format!("inflating {:?}", path))?;
    dst.flush()?;

    log::debug!("inflated {:?} -> {:?} ({} bytes)", path, out_path, written);
    Ok(())
}

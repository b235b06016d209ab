use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::Context;

/// One block handed out by [`BlockReader::read_block`].
///
/// `data[..dlen]` is the useful, not-yet-scanned region. `data[dlen..]` is
/// lookahead drawn from the bytes that follow; it will be handed out again
/// as useful bytes by a later read.
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    /// Absolute stream offset of `data[0]`.
    pub offset: u64,
    pub data: &'a [u8],
    pub dlen: usize,
}

impl Block<'_> {
    /// True once the reader has no useful bytes left.
    pub fn is_empty(&self) -> bool {
        self.dlen == 0
    }
}

/// Sequential block reader with a lookahead margin.
///
/// # Read contract
/// Call [`configure`] once, then [`read_block`] until it returns a block with
/// `dlen == 0`. Concatenating every block's `data[..dlen]` reproduces the
/// scanned region exactly once. Every block carries up to `peek_size` extra
/// bytes past `dlen` so that a fixed-width window starting at any useful
/// index still sees real trailing data.
///
/// ```text
///  useful region [offset, offset + length)
///  ├── block 0: [ dlen ][ peek ]
///  │                    ├── block 1: [ dlen ][ peek ]
///  │                                         ├── block 2: ...
/// ```
///
/// The peek bytes may reach past the `length` limit up to physical EOF; they
/// are lookahead only and never advance [`tell`].
///
/// [`configure`]: BlockReader::configure
/// [`read_block`]: BlockReader::read_block
/// [`tell`]: BlockReader::tell
pub struct BlockReader<R> {
    inner: R,
    block_size: usize,
    peek_size: usize,
    /// Absolute offset the scan started at.
    start: u64,
    /// Useful bytes this reader will hand out in total.
    limit: u64,
    /// Sum of all `dlen` values handed out so far.
    consumed: u64,
    /// Bytes read from `inner` but not yet consumed as useful.
    buffer: Vec<u8>,
    /// Useful length of the block most recently returned.
    last_dlen: usize,
    eof: bool,
    configured: bool,
}

impl BlockReader<BufReader<File>> {
    /// Open `path` for scanning `length` bytes (or to EOF) from `offset`.
    pub fn open(path: impl AsRef<Path>, offset: u64, length: Option<u64>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
        Self::new(BufReader::new(file), offset, length)
    }
}

impl<R: Read + Seek> BlockReader<R> {
    /// Wrap any seekable reader. Seeks to `offset` immediately.
    pub fn new(mut inner: R, offset: u64, length: Option<u64>) -> anyhow::Result<Self> {
        let end = inner.seek(SeekFrom::End(0))?;
        if offset > end {
            anyhow::bail!("start offset {} is beyond end of stream ({} bytes)", offset, end);
        }
        inner.seek(SeekFrom::Start(offset))?;
        let available = end - offset;
        let limit = length.map_or(available, |l| l.min(available));

        Ok(Self {
            inner,
            block_size: 0,
            peek_size: 0,
            start: offset,
            limit,
            consumed: 0,
            buffer: Vec::new(),
            last_dlen: 0,
            eof: false,
            configured: false,
        })
    }

    /// Fix the useful block size and the lookahead carried by every read.
    ///
    /// Must be called before the first [`read_block`](Self::read_block).
    pub fn configure(&mut self, block_size: usize, peek_size: usize) -> anyhow::Result<()> {
        if block_size == 0 {
            anyhow::bail!("block size must be non-zero");
        }
        if self.consumed > 0 || self.last_dlen > 0 {
            anyhow::bail!("block reader cannot be reconfigured after reading has started");
        }
        self.block_size = block_size;
        self.peek_size = peek_size;
        self.buffer = Vec::with_capacity(block_size + peek_size);
        self.configured = true;
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn peek_size(&self) -> usize {
        self.peek_size
    }

    /// Absolute offset of the scan start.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Absolute offset of the first useful byte not yet handed out.
    pub fn tell(&self) -> u64 {
        self.start + self.consumed
    }

    /// Total number of useful bytes this reader produces.
    pub fn total(&self) -> u64 {
        self.limit
    }

    /// Return the next block. A block with `dlen == 0` marks end of stream.
    pub fn read_block(&mut self) -> anyhow::Result<Block<'_>> {
        if !self.configured {
            anyhow::bail!("block reader used before configure()");
        }

        // The previous block's useful bytes are done; its peek becomes the
        // head of this block.
        self.buffer.drain(..self.last_dlen);
        self.consumed += self.last_dlen as u64;
        self.last_dlen = 0;

        self.fill(self.block_size + self.peek_size)?;

        let remaining = self.limit - self.consumed;
        let dlen = self
            .block_size
            .min(self.buffer.len())
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.last_dlen = dlen;

        Ok(Block {
            offset: self.tell(),
            data: &self.buffer,
            dlen,
        })
    }

    /// Read from `inner` until the buffer holds `want` bytes or EOF.
    fn fill(&mut self, want: usize) -> anyhow::Result<()> {
        let mut chunk = [0u8; 8192];
        while !self.eof && self.buffer.len() < want {
            let n = (want - self.buffer.len()).min(chunk.len());
            match self.inner.read(&mut chunk[..n]) {
                Ok(0) => self.eof = true,
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

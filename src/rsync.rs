//! Streaming rsync scan: match a new file against the old container's blocks.
//!
//! A window of [`BLOCK_SIZE`] bytes slides over the new file. While it does
//! not match, the rolling checksum moves one byte at a time and the byte that
//! leaves the window becomes fresh data. When it matches an old block, the
//! window jumps a whole block ahead. Memory stays bounded by one maximal data
//! op plus two blocks, whatever the file size.

use std::io::Read;

use rustc_hash::FxHashMap;

use crate::checksum::{weak_hash, RollingChecksum};
use crate::error::Result;
use crate::ops::{OpEmitter, MAX_DATA_OP};
use crate::pool::read_full;
use crate::signature::{BlockLibrary, BlockMatch, BLOCK_SIZE};

const BUFFER_SIZE: usize = MAX_DATA_OP + 2 * BLOCK_SIZE;

/// What a scan found, besides the ops it emitted.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Bytes read from the new file.
    pub bytes_read: u64,
    /// Reused bytes, per old file index.
    pub reused_by_file: FxHashMap<usize, u64>,
}

impl ScanOutcome {
    /// Old file that contributed the most reused bytes. Ties go to
    /// `preferred_file`, then to the lowest index.
    #[must_use]
    pub fn best_source(&self, preferred_file: Option<usize>) -> Option<usize> {
        self.reused_by_file
            .iter()
            .max_by(|(a_index, a_bytes), (b_index, b_bytes)| {
                a_bytes
                    .cmp(b_bytes)
                    .then_with(|| {
                        (Some(**a_index) == preferred_file).cmp(&(Some(**b_index) == preferred_file))
                    })
                    .then_with(|| b_index.cmp(a_index))
            })
            .map(|(index, _)| *index)
    }
}

/// Scans new files against a block library.
pub struct RsyncScanner<'a> {
    library: &'a BlockLibrary,
    buf: Vec<u8>,
}

impl<'a> RsyncScanner<'a> {
    /// Create a scanner over `library`.
    #[must_use]
    pub fn new(library: &'a BlockLibrary) -> Self {
        Self {
            library,
            buf: vec![0u8; BUFFER_SIZE],
        }
    }

    fn lookup(
        &self,
        weak: u32,
        window: &[u8],
        preferred_file: Option<usize>,
        emitter: &OpEmitter<'_>,
    ) -> Option<BlockMatch> {
        if !self.library.has_weak(weak) {
            return None;
        }
        let expected = emitter.next_expected().and_then(|(file_index, block_index)| {
            usize::try_from(file_index).ok().map(|f| (f, block_index))
        });
        self.library.find(weak, window, preferred_file, expected)
    }

    /// Scan `reader` to its end, emitting ops into `emitter`.
    ///
    /// `preferred_file` is the old file at the same path, if any. `on_read`
    /// is told about every chunk of bytes read.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the emitter rejects an op.
    pub fn scan(
        &mut self,
        reader: &mut dyn Read,
        preferred_file: Option<usize>,
        emitter: &mut OpEmitter<'_>,
        on_read: &mut dyn FnMut(u64),
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        let mut end = 0usize;
        let mut eof = false;
        // Fresh bytes start at `lit`, the window starts at `pos`.
        let mut lit = 0usize;
        let mut pos = 0usize;
        let mut rolling: Option<RollingChecksum> = None;

        loop {
            if end - pos < BLOCK_SIZE && !eof {
                if lit > 0 {
                    self.buf.copy_within(lit..end, 0);
                    pos -= lit;
                    end -= lit;
                    lit = 0;
                }
                let room = self.buf.len() - end;
                let n = read_full(reader, &mut self.buf[end..])?;
                end += n;
                eof = n < room;
                outcome.bytes_read += n as u64;
                on_read(n as u64);
                continue;
            }

            let avail = end - pos;
            if avail >= BLOCK_SIZE {
                let window = &self.buf[pos..pos + BLOCK_SIZE];
                let weak = *rolling.get_or_insert_with(|| RollingChecksum::new(window));
                if let Some(found) = self.lookup(weak.digest(), window, preferred_file, emitter) {
                    emitter.push_data(&self.buf[lit..pos])?;
                    emitter.push_block(found.file_index as u64, found.block_index, BLOCK_SIZE as u64)?;
                    *outcome.reused_by_file.entry(found.file_index).or_default() +=
                        BLOCK_SIZE as u64;
                    pos += BLOCK_SIZE;
                    lit = pos;
                    rolling = None;
                    continue;
                }

                if pos - lit >= MAX_DATA_OP {
                    emitter.push_data(&self.buf[lit..pos])?;
                    lit = pos;
                }
                match rolling.as_mut() {
                    Some(sum) if pos + BLOCK_SIZE < end => {
                        sum.roll(self.buf[pos], self.buf[pos + BLOCK_SIZE]);
                    }
                    _ => rolling = None,
                }
                pos += 1;
                continue;
            }

            // End of input with less than a block left: the tail can only
            // match a short last block of an old file.
            if avail > 0 {
                let tail = &self.buf[pos..end];
                if let Some(found) = self.lookup(weak_hash(tail), tail, preferred_file, emitter) {
                    emitter.push_data(&self.buf[lit..pos])?;
                    emitter.push_block(found.file_index as u64, found.block_index, avail as u64)?;
                    *outcome.reused_by_file.entry(found.file_index).or_default() += avail as u64;
                    lit = end;
                }
            }
            emitter.push_data(&self.buf[lit..end])?;
            return Ok(outcome);
        }
    }
}

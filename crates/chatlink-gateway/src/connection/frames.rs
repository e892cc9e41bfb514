//! Frame assembly and zlib-stream inflation
//!
//! With transport compression the gateway sends one zlib stream for the whole
//! connection, flushed after every logical message. A message is complete once
//! the accumulated bytes end with the sync-flush marker `00 00 ff ff`.

use flate2::{Decompress, FlushDecompress, Status};

const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Buffers above this size are dropped once a smaller message comes through
const LARGE_BUFFER: usize = 10_000;
const INFLATE_CHUNK: usize = 4096;

/// Continuous decompression context, alive as long as its connection
pub(crate) struct Inflater {
    zlib: Decompress,
}

impl Inflater {
    pub(crate) fn new() -> Self {
        Self {
            zlib: Decompress::new(true),
        }
    }

    /// Inflate everything in `input`, appending to `out`
    pub(crate) fn inflate(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), flate2::DecompressError> {
        let mut consumed = 0usize;
        loop {
            if out.capacity() - out.len() < INFLATE_CHUNK {
                out.reserve(INFLATE_CHUNK);
            }

            let in_before = self.zlib.total_in();
            let out_before = out.len();
            let status = self.zlib.decompress_vec(&input[consumed..], out, FlushDecompress::Sync)?;
            let read = (self.zlib.total_in() - in_before) as usize;
            consumed += read;

            if status == Status::StreamEnd {
                return Ok(());
            }
            // Done once all input is in and the output wasn't cut short
            if consumed >= input.len() && out.len() < out.capacity() {
                return Ok(());
            }
            if read == 0 && out.len() == out_before {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for Inflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("total_in", &self.zlib.total_in())
            .field("total_out", &self.zlib.total_out())
            .finish()
    }
}

/// Turns transport messages into complete JSON documents
///
/// Owned by one reader; both buffers are reused between messages.
#[derive(Debug)]
pub(crate) struct FrameAssembler {
    compressed: bool,
    pending: Vec<u8>,
    inflated: Vec<u8>,
    inflater: Inflater,
}

impl FrameAssembler {
    pub(crate) fn new(compressed: bool) -> Self {
        Self {
            compressed,
            pending: Vec::new(),
            inflated: Vec::new(),
            inflater: Inflater::new(),
        }
    }

    /// Feed one binary message
    ///
    /// Returns the decoded document once a full message has arrived.
    pub(crate) fn push_binary(&mut self, data: &[u8]) -> Result<Option<&[u8]>, flate2::DecompressError> {
        if !self.compressed {
            return Ok(Some(self.plain(data)));
        }

        self.pending.extend_from_slice(data);
        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        self.inflated.clear();
        let result = self.inflater.inflate(&self.pending, &mut self.inflated);
        release_excess(&mut self.pending);
        self.pending.clear();
        result?;

        release_excess(&mut self.inflated);
        Ok(Some(&self.inflated))
    }

    /// Text messages are never compressed
    pub(crate) fn push_text(&mut self, data: &str) -> &[u8] {
        self.plain(data.as_bytes())
    }

    fn plain(&mut self, data: &[u8]) -> &[u8] {
        self.inflated.clear();
        self.inflated.extend_from_slice(data);
        release_excess(&mut self.inflated);
        &self.inflated
    }

    /// Bytes of an unfinished compressed message
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Give back memory an earlier large message left behind
fn release_excess(buf: &mut Vec<u8>) {
    if buf.capacity() > LARGE_BUFFER && buf.len() < LARGE_BUFFER {
        buf.shrink_to(buf.len().max(INFLATE_CHUNK));
    }
}

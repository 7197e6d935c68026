//! Amplitude modulation waveforms
//!
//! A modulation is streamed in bounded chunks across many frames. The cursor
//! `sent` marks how far the current drain pass has progressed.

/// Modulation waveform with its drain cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modulation {
    buffer: Vec<u8>,
    sent: usize,
}

/// One chunk taken from a modulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModulationChunk<'a> {
    pub data: &'a [u8],
    /// First chunk of a drain pass
    pub loop_begin: bool,
    /// Last chunk of a drain pass
    pub loop_end: bool,
}

impl Modulation {
    pub fn new(buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: buffer.into(),
            sent: 0,
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes already transmitted in the current drain pass
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.sent)
    }

    /// Whether the current drain pass has consumed the whole buffer
    pub fn is_drained(&self) -> bool {
        self.sent >= self.buffer.len()
    }

    /// Reset the cursor for the next drain pass
    pub fn rewind(&mut self) {
        self.sent = 0;
    }

    /// Take the next chunk of at most `max` bytes and advance the cursor
    pub fn next_chunk(&mut self, max: usize) -> ModulationChunk<'_> {
        let start = self.sent;
        let len = self.remaining().min(max);
        let end = start + len;
        self.sent = end;

        ModulationChunk {
            data: &self.buffer[start..end],
            loop_begin: start == 0,
            loop_end: end >= self.buffer.len(),
        }
    }
}

impl From<Vec<u8>> for Modulation {
    fn from(buffer: Vec<u8>) -> Self {
        Self::new(buffer)
    }
}

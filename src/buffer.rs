//! Result buffer holding raw latency samples.
//!
//! Samples are stored typed. They are serialized to bytes only at the export
//! boundary, as consecutive 16-byte records: `start` then `duration`, each a
//! little-endian `u64`.

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of one exported sample record in bytes.
pub const SAMPLE_SIZE: usize = 16;

/// One timed MMIO read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Raw cycle counter value when the timed window opened.
    pub start: u64,
    /// Window length in counter ticks, instrumentation overhead included.
    pub duration: u64,
}

impl Sample {
    /// Create a new sample.
    pub fn new(start: u64, duration: u64) -> Self {
        Self { start, duration }
    }

    /// Encode as an export record.
    pub fn to_bytes(&self) -> [u8; SAMPLE_SIZE] {
        let mut out = [0u8; SAMPLE_SIZE];
        out[..8].copy_from_slice(&self.start.to_le_bytes());
        out[8..].copy_from_slice(&self.duration.to_le_bytes());
        out
    }

    /// Decode an export record.
    pub fn from_bytes(bytes: &[u8; SAMPLE_SIZE]) -> Self {
        let mut start = [0u8; 8];
        let mut duration = [0u8; 8];
        start.copy_from_slice(&bytes[..8]);
        duration.copy_from_slice(&bytes[8..]);
        Self {
            start: u64::from_le_bytes(start),
            duration: u64::from_le_bytes(duration),
        }
    }
}

/// Decode exported bytes back into samples. A trailing partial record is
/// dropped.
pub fn decode_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks_exact(SAMPLE_SIZE)
        .map(|chunk| {
            let mut record = [0u8; SAMPLE_SIZE];
            record.copy_from_slice(chunk);
            Sample::from_bytes(&record)
        })
        .collect()
}

/// Fixed-length sample storage, sized exactly to the configured loop count.
#[derive(Debug, Default)]
pub struct ResultBuffer {
    samples: Vec<Sample>,
}

impl ResultBuffer {
    /// Allocate a zeroed buffer of `len` samples.
    pub fn with_len(len: u32) -> Result<Self> {
        Ok(Self {
            samples: allocate(len)?,
        })
    }

    /// Resize to `len` samples.
    ///
    /// A different length allocates a fresh zeroed buffer and discards the
    /// old one. If the allocation fails the old buffer stays untouched. The
    /// same length keeps the allocation and zeroes it.
    pub fn resize(&mut self, len: u32) -> Result<()> {
        if self.samples.len() == len as usize {
            self.clear();
            return Ok(());
        }
        self.samples = allocate(len)?;
        Ok(())
    }

    /// Zero every sample in place.
    pub fn clear(&mut self) {
        self.samples.fill(Sample::default());
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Length of the exported byte stream.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * SAMPLE_SIZE
    }

    /// Allocated capacity in bytes. Never smaller than `byte_len()`.
    pub fn capacity_bytes(&self) -> usize {
        self.samples.capacity() * SAMPLE_SIZE
    }

    /// All samples in iteration order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Samples `start..end`, or `None` if the range is out of bounds.
    pub fn range(&self, start: usize, end: usize) -> Option<&[Sample]> {
        self.samples.get(start..end)
    }

    pub(crate) fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// Copy exported bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied: zero at or past the end, the
    /// remainder when `buf` reaches past the end.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let total = self.byte_len() as u64;
        if offset >= total || buf.is_empty() {
            return 0;
        }
        let count = buf.len().min((total - offset) as usize);

        let mut pos = offset as usize;
        let mut written = 0;
        while written < count {
            let record = self.samples[pos / SAMPLE_SIZE].to_bytes();
            let within = pos % SAMPLE_SIZE;
            let n = (SAMPLE_SIZE - within).min(count - written);
            buf[written..written + n].copy_from_slice(&record[within..within + n]);
            written += n;
            pos += n;
        }
        count
    }

    /// The whole export byte stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_bytes());
        }
        out
    }

    /// Sequential reader over the export byte stream.
    pub fn reader(&self) -> SampleReader<'_> {
        SampleReader {
            buffer: self,
            pos: 0,
        }
    }
}

fn allocate(len: u32) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    samples
        .try_reserve_exact(len as usize)
        .map_err(|_| Error::AllocationFailure { samples: len })?;
    samples.resize(len as usize, Sample::default());
    Ok(samples)
}

/// [`io::Read`] adapter returned by [`ResultBuffer::reader`].
#[derive(Debug)]
pub struct SampleReader<'a> {
    buffer: &'a ResultBuffer,
    pos: u64,
}

impl io::Read for SampleReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffer.read_at(self.pos, buf);
        self.pos += n as u64;
        Ok(n)
    }
}

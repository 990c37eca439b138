use crate::TransferError;

/// Number of chunks `len` bytes split into at `chunk_size`.
///
/// `ceil(len / chunk_size)`; zero for an empty buffer.
pub fn total_chunks(len: usize, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    len.div_ceil(chunk_size) as u32
}

/// One plaintext slice of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainChunk<'a> {
    pub index: u32,
    /// Byte offset within the file.
    pub offset: usize,
    pub data: &'a [u8],
}

/// Splits an in-memory file into fixed-size chunks.
///
/// Every chunk is exactly `chunk_size` bytes except the last, which holds
/// the remainder.
#[derive(Debug, Clone)]
pub struct ChunkReader<'a> {
    data: &'a [u8],
    chunk_size: usize,
    next_index: u32,
}

impl<'a> ChunkReader<'a> {
    /// Rejects empty files and a zero chunk size.
    pub fn new(data: &'a [u8], chunk_size: usize) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        if data.is_empty() {
            return Err(TransferError::EmptyFile);
        }
        Ok(Self {
            data,
            chunk_size,
            next_index: 0,
        })
    }

    /// Moves to chunk `index` (for resume). Past-the-end positions yield
    /// no further chunks.
    pub fn seek_to(&mut self, index: u32) {
        self.next_index = index;
    }

    /// Returns chunk `index` without moving the cursor.
    pub fn chunk(&self, index: u32) -> Option<PlainChunk<'a>> {
        let offset = (index as usize).checked_mul(self.chunk_size)?;
        if offset >= self.data.len() {
            return None;
        }
        let end = (offset + self.chunk_size).min(self.data.len());
        Some(PlainChunk {
            index,
            offset,
            data: &self.data[offset..end],
        })
    }

    pub fn next_chunk(&mut self) -> Option<PlainChunk<'a>> {
        let chunk = self.chunk(self.next_index)?;
        self.next_index += 1;
        Some(chunk)
    }

    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.data.len(), self.chunk_size)
    }
}

impl<'a> Iterator for ChunkReader<'a> {
    type Item = PlainChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

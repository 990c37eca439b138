use std::collections::HashSet;

use relaybox_protocol::{ChunkDescriptor, FileId, UploadedFile};

use crate::TransferError;

const MAX_FILENAME_LEN: usize = 120;

/// Reduces a user-supplied filename hint to a safe single path component.
///
/// Directory parts are stripped; control characters, separators and
/// reserved punctuation become `_`. Falls back to `file` when nothing
/// usable remains.
pub fn sanitize_filename(hint: &str) -> String {
    let base = hint.rsplit(['/', '\\']).next().unwrap_or(hint);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            c if c.is_control() => '_',
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c => c,
        })
        .take(MAX_FILENAME_LEN)
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Validates a descriptor set for `file_id` and returns it ordered by
/// chunk index.
///
/// Rejects:
/// - Empty sets
/// - Duplicate indices
/// - Gaps (indices must be exactly `0..n`)
/// - A count different from `expected_total`, when given
/// - Descriptors without a backend handle or integrity hash
/// - Chunk ids that do not belong to `file_id`
/// - Declared plaintext sizes whose sum does not fit in a `u64`
pub fn sorted_descriptors<'a>(
    file_id: &FileId,
    descriptors: &'a [ChunkDescriptor],
    expected_total: Option<u32>,
) -> Result<Vec<&'a ChunkDescriptor>, TransferError> {
    if descriptors.is_empty() {
        return Err(TransferError::InvalidDescriptors("no chunks".into()));
    }
    if let Some(total) = expected_total {
        if descriptors.len() != total as usize {
            return Err(TransferError::InvalidDescriptors(format!(
                "expected {total} chunks, got {}",
                descriptors.len()
            )));
        }
    }

    let mut seen = HashSet::with_capacity(descriptors.len());
    let mut declared: u64 = 0;
    for d in descriptors {
        declared = declared.checked_add(d.plain_size).ok_or_else(|| {
            TransferError::InvalidDescriptors(format!(
                "chunk {} declares {} bytes, total overflows",
                d.chunk_index, d.plain_size
            ))
        })?;
        if !seen.insert(d.chunk_index) {
            return Err(TransferError::InvalidDescriptors(format!(
                "duplicate chunk index {}",
                d.chunk_index
            )));
        }
        if d.backend_file_ref.is_empty() {
            return Err(TransferError::InvalidDescriptors(format!(
                "chunk {} has no backend handle",
                d.chunk_index
            )));
        }
        if d.integrity_hash.is_empty() {
            return Err(TransferError::InvalidDescriptors(format!(
                "chunk {} has no integrity hash",
                d.chunk_index
            )));
        }
        if !d.chunk_id.is_empty() && d.chunk_id != file_id.chunk_id(d.chunk_index) {
            return Err(TransferError::InvalidDescriptors(format!(
                "chunk {} belongs to another file ({})",
                d.chunk_index, d.chunk_id
            )));
        }
    }

    let mut ordered: Vec<&ChunkDescriptor> = descriptors.iter().collect();
    ordered.sort_by_key(|d| d.chunk_index);
    if let Some((pos, d)) = ordered
        .iter()
        .enumerate()
        .find(|(pos, d)| d.chunk_index as usize != *pos)
    {
        return Err(TransferError::InvalidDescriptors(format!(
            "missing chunk {pos} (next present is {})",
            d.chunk_index
        )));
    }
    Ok(ordered)
}

/// Validates the descriptors of a whole uploaded file.
///
/// On top of [`sorted_descriptors`], the chunk count must equal
/// `total_chunks` and, when every chunk declares its plaintext size, the
/// sizes must add up to `file.size`.
pub fn validate_uploaded_file(
    file: &UploadedFile,
) -> Result<Vec<&ChunkDescriptor>, TransferError> {
    let ordered = sorted_descriptors(&file.file_id, &file.chunks, Some(file.total_chunks))?;
    if ordered.iter().all(|d| d.plain_size != 0) {
        // Overflow was ruled out above.
        let declared: u64 = ordered.iter().map(|d| d.plain_size).sum();
        if declared != file.size {
            return Err(TransferError::InvalidDescriptors(format!(
                "chunks declare {declared} bytes, file size is {}",
                file.size
            )));
        }
    }
    Ok(ordered)
}

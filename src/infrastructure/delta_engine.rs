// Delta synchronization engine: fixed-offset chunk signatures, delta
// construction against a base signature, and delta application with
// integrity verification. Chunk identity is SHA-256 only.

use std::collections::HashMap;
use tracing::debug;

use crate::core::sha256_hex;
use crate::error::{AppError, AppResult};
use crate::models::{ChunkSignature, Delta, DeltaMetrics, DeltaOp};

#[derive(Debug, Clone)]
pub struct DeltaEngine {
    chunk_size: usize,
}

impl DeltaEngine {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split content into fixed-offset chunks; the final chunk may be short.
    /// Empty content yields an empty signature.
    pub fn signature(&self, content: &[u8]) -> Vec<ChunkSignature> {
        content
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| ChunkSignature {
                index,
                offset: (index * self.chunk_size) as u64,
                size: chunk.len(),
                hash: sha256_hex(chunk),
            })
            .collect()
    }

    /// Digest identifying a base signature, so a receiver can detect a delta
    /// computed against the wrong base.
    pub fn signature_digest(signature: &[ChunkSignature]) -> String {
        let mut joined = String::with_capacity(signature.len() * 64);
        for sig in signature {
            joined.push_str(&sig.hash);
        }
        sha256_hex(joined.as_bytes())
    }

    /// Build a delta transforming the base signature's content into
    /// `new_content`. Chunks whose hash appears in the base become copy
    /// spans (first occurrence wins, contiguous spans merged); everything
    /// else is an insert carrying the chunk bytes.
    pub fn delta(&self, base_signature: &[ChunkSignature], new_content: &[u8]) -> Delta {
        let mut base_index: HashMap<&str, usize> = HashMap::new();
        for sig in base_signature {
            base_index.entry(sig.hash.as_str()).or_insert(sig.index);
        }

        let new_signature = self.signature(new_content);
        let mut operations: Vec<DeltaOp> = Vec::new();

        for sig in &new_signature {
            match base_index.get(sig.hash.as_str()) {
                Some(&from) => {
                    // Extend the previous copy span when the base index is contiguous
                    if let Some(DeltaOp::Copy {
                        from_index,
                        count,
                        size,
                    }) = operations.last_mut()
                    {
                        if *from_index + *count == from {
                            *count += 1;
                            *size += sig.size as u64;
                            continue;
                        }
                    }
                    operations.push(DeltaOp::Copy {
                        from_index: from,
                        count: 1,
                        size: sig.size as u64,
                    });
                }
                None => {
                    let start = sig.offset as usize;
                    let end = start + sig.size;
                    operations.push(DeltaOp::Insert {
                        index: sig.index,
                        chunk_hash: sig.hash.clone(),
                        size: sig.size,
                        bytes: Some(new_content[start..end].to_vec()),
                    });
                }
            }
        }

        debug!(
            "Delta built: {} ops over {} new chunks",
            operations.len(),
            new_signature.len()
        );

        Delta {
            base_signature_digest: Self::signature_digest(base_signature),
            operations,
        }
    }

    /// Reconstruct new content from base content plus a delta. Fails with
    /// `DeltaIntegrity` when the delta was computed against a different
    /// base or the result does not hash to the originator's declared hash.
    /// Insert ops must carry bytes; callers hydrate them from the chunk
    /// store before applying.
    pub fn apply(
        &self,
        base_content: &[u8],
        delta: &Delta,
        expected_content_hash: &str,
    ) -> AppResult<Vec<u8>> {
        let base_signature = self.signature(base_content);
        let base_digest = Self::signature_digest(&base_signature);
        if base_digest != delta.base_signature_digest {
            return Err(AppError::DeltaIntegrity(format!(
                "delta base digest {} does not match supplied base {}",
                delta.base_signature_digest, base_digest
            )));
        }

        let expected_len: u64 = delta.operations.iter().map(|op| op.byte_len()).sum();
        let mut output = Vec::with_capacity(expected_len as usize);

        for op in &delta.operations {
            match op {
                DeltaOp::Copy {
                    from_index, count, ..
                } => {
                    let last = from_index + count;
                    if last > base_signature.len() {
                        return Err(AppError::DeltaIntegrity(format!(
                            "copy span {}..{} exceeds base of {} chunks",
                            from_index,
                            last,
                            base_signature.len()
                        )));
                    }
                    let start = base_signature[*from_index].offset as usize;
                    let end_sig = &base_signature[last - 1];
                    let end = end_sig.offset as usize + end_sig.size;
                    output.extend_from_slice(&base_content[start..end]);
                }
                DeltaOp::Insert {
                    chunk_hash, bytes, ..
                } => match bytes {
                    Some(bytes) => {
                        if sha256_hex(bytes) != *chunk_hash {
                            return Err(AppError::DeltaIntegrity(format!(
                                "insert bytes do not hash to {}",
                                chunk_hash
                            )));
                        }
                        output.extend_from_slice(bytes);
                    }
                    None => {
                        return Err(AppError::MissingChunk(format!(
                            "insert op for {} carries no bytes",
                            chunk_hash
                        )));
                    }
                },
            }
        }

        if output.len() as u64 != expected_len {
            return Err(AppError::DeltaIntegrity(format!(
                "reconstructed {} bytes, delta declares {}",
                output.len(),
                expected_len
            )));
        }
        let actual_hash = sha256_hex(&output);
        if actual_hash != expected_content_hash {
            return Err(AppError::DeltaIntegrity(format!(
                "reconstructed content hashes to {} but {} was declared",
                actual_hash, expected_content_hash
            )));
        }

        Ok(output)
    }

    /// Savings accounting for a delta
    pub fn metrics(delta: &Delta) -> DeltaMetrics {
        let mut metrics = DeltaMetrics::default();
        for op in &delta.operations {
            match op {
                DeltaOp::Copy { count, size, .. } => {
                    metrics.chunks_copied += count;
                    metrics.chunks_total += count;
                    metrics.bytes_saved += size;
                }
                DeltaOp::Insert { size, .. } => {
                    metrics.chunks_inserted += 1;
                    metrics.chunks_total += 1;
                    metrics.bytes_transferred += *size as u64;
                }
            }
        }
        let total_bytes = metrics.bytes_transferred + metrics.bytes_saved;
        metrics.compression_ratio = if total_bytes > 0 {
            metrics.bytes_saved as f64 / total_bytes as f64
        } else {
            0.0
        };
        metrics
    }
}

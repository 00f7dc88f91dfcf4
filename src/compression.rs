//! Scalar quantisation of dense vectors for compact storage

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// A dense vector quantised to one byte per component
///
/// Components are mapped linearly from [min, min + scale * 255] onto u8.
/// Decompression is lossy; the error per component is bounded by scale / 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedVector {
    pub dimension: usize,
    pub min: f32,
    pub scale: f32,
    pub data: Vec<u8>,
}

impl CompressedVector {
    /// Quantise a dense vector
    pub fn compress(vector: &[f32]) -> Self {
        let min = vector.iter().copied().fold(f32::INFINITY, f32::min);
        let max = vector.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        if vector.is_empty() || !min.is_finite() || !max.is_finite() {
            return Self {
                dimension: vector.len(),
                min: 0.0,
                scale: 0.0,
                data: vec![0; vector.len()],
            };
        }

        let range = max - min;
        let scale = if range > 0.0 { range / 255.0 } else { 0.0 };

        let data = vector
            .iter()
            .map(|&v| {
                if scale == 0.0 {
                    0u8
                } else {
                    (((v - min) / scale).round().clamp(0.0, 255.0)) as u8
                }
            })
            .collect();

        Self {
            dimension: vector.len(),
            min,
            scale,
            data,
        }
    }

    /// Reconstruct the dense vector
    pub fn decompress(&self) -> Vec<f32> {
        self.data
            .iter()
            .map(|&b| self.min + b as f32 * self.scale)
            .collect()
    }

    /// Serialise to a base64 text form suitable for string index fields
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(12 + self.data.len());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&self.min.to_le_bytes());
        bytes.extend_from_slice(&self.scale.to_le_bytes());
        bytes.extend_from_slice(&self.data);
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    /// Parse the base64 text form
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RagError::Validation(format!("invalid vector archive: {}", e)))?;

        if bytes.len() < 12 {
            return Err(RagError::Validation(
                "vector archive header truncated".to_string(),
            ));
        }

        let dimension = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let min = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let scale = f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let data = bytes[12..].to_vec();

        if data.len() != dimension {
            return Err(RagError::Validation(format!(
                "vector archive length {} does not match dimension {}",
                data.len(),
                dimension
            )));
        }

        Ok(Self {
            dimension,
            min,
            scale,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress_bounded_error() {
        let vector: Vec<f32> = (0..64).map(|i| (i as f32 * 0.13).sin()).collect();
        let compressed = CompressedVector::compress(&vector);
        let restored = compressed.decompress();

        assert_eq!(restored.len(), vector.len());
        let tolerance = compressed.scale / 2.0 + f32::EPSILON;
        for (orig, rest) in vector.iter().zip(restored.iter()) {
            assert!(
                (orig - rest).abs() <= tolerance,
                "component error {} above tolerance {}",
                (orig - rest).abs(),
                tolerance
            );
        }
    }

    #[test]
    fn test_constant_vector() {
        let vector = vec![0.5; 8];
        let compressed = CompressedVector::compress(&vector);
        assert_eq!(compressed.scale, 0.0);
        assert_eq!(compressed.decompress(), vector);
    }

    #[test]
    fn test_base64_roundtrip() {
        let vector = vec![-1.0, 0.0, 0.25, 1.0];
        let compressed = CompressedVector::compress(&vector);
        let encoded = compressed.to_base64();
        let decoded = CompressedVector::from_base64(&encoded).unwrap();
        assert_eq!(decoded, compressed);
    }

    #[test]
    fn test_rejects_corrupt_archive() {
        assert!(CompressedVector::from_base64("not base64 at all!").is_err());

        let truncated = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(CompressedVector::from_base64(&truncated).is_err());
    }
}

//! Fixed-length feature vector helpers.
//!
//! Vectors are persisted as little-endian `f32` BLOBs, 4 bytes per element.

/// Serialize a vector to a little-endian BLOB.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Reverses [`vec_to_blob`]. Trailing bytes that do not form a full `f32`
/// are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Zero-pad or truncate to exactly `dims` elements.
pub fn fit_dims(mut vec: Vec<f32>, dims: usize) -> Vec<f32> {
    vec.resize(dims, 0.0);
    vec
}

/// Element-wise `target - source`, after fitting both to `dims`.
pub fn delta(source: &[f32], target: &[f32], dims: usize) -> Vec<f32> {
    (0..dims)
        .map(|i| target.get(i).copied().unwrap_or(0.0) - source.get(i).copied().unwrap_or(0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_layout() {
        let blob = vec_to_blob(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(blob_to_vec(&blob), vec![1.0, -2.5]);
        assert!(blob_to_vec(&[]).is_empty());
    }

    #[test]
    fn test_fit_dims() {
        assert_eq!(fit_dims(vec![1.0], 3), vec![1.0, 0.0, 0.0]);
        assert_eq!(fit_dims(vec![1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
    }

    #[test]
    fn test_delta_pads_shorter_side() {
        assert_eq!(delta(&[1.0, 1.0], &[3.0], 3), vec![2.0, -1.0, 0.0]);
    }
}

use crate::errors::EmbeddingError;

/// Cosine similarity in [-1, 1]. Defined as 0 when either vector has zero
/// norm or the dimensions disagree.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Vector blob layout: u32 little-endian length prefix followed by f32
/// little-endian components. Stored as the `embedding` column.
pub fn encode_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + v.len() * 4);
    out.extend_from_slice(&(v.len() as u32).to_le_bytes());
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn decode_blob(blob: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
    if blob.len() < 4 {
        return Err(EmbeddingError::MalformedBlob(format!(
            "{} bytes, need at least 4",
            blob.len()
        )));
    }
    let len = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    let expected = 4 + len * 4;
    if blob.len() != expected {
        return Err(EmbeddingError::MalformedBlob(format!(
            "length prefix says {len} floats ({expected} bytes), blob is {} bytes",
            blob.len()
        )));
    }
    let mut v = Vec::with_capacity(len);
    for chunk in blob[4..].chunks_exact(4) {
        v.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_exact() {
        let v = vec![0.25f32, -1.5, 3.25, 0.0, f32::MIN_POSITIVE];
        let blob = encode_blob(&v);
        assert_eq!(decode_blob(&blob).unwrap(), v);
    }

    #[test]
    fn roundtrip_empty_vector() {
        let blob = encode_blob(&[]);
        assert_eq!(blob.len(), 4);
        assert_eq!(decode_blob(&blob).unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn truncated_blob_rejected() {
        let mut blob = encode_blob(&[1.0, 2.0, 3.0]);
        blob.pop();
        assert!(matches!(
            decode_blob(&blob),
            Err(EmbeddingError::MalformedBlob(_))
        ));
    }

    #[test]
    fn tiny_blob_rejected() {
        assert!(decode_blob(&[1, 2]).is_err());
    }

    #[test]
    fn cosine_identity() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        assert!((cosine(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn cosine_opposite() {
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_norm_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_dim_mismatch_is_zero() {
        assert_eq!(cosine(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[test]
    fn normalize_produces_unit_vector() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_vector_unchanged() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}

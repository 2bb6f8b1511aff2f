//! Fixed-point embedding packer
//!
//! Embeddings (`embedding:N`) are float vectors. JSON rendering of floats is
//! wasteful inside the metadata budget; each component is instead scaled to
//! a fixed-point integer and base62-encoded, joined with `_`.

use crate::encoding::base62;

/// Default scale: six decimal digits of precision.
pub const DEFAULT_SCALE: f64 = 1_000_000.0;

/// Pack a float vector into a `_`-joined base62 string.
pub fn pack(values: &[f64], scale: f64) -> String {
    values
        .iter()
        .map(|v| base62::encode_i64((v * scale).round() as i64))
        .collect::<Vec<_>>()
        .join("_")
}

/// Unpack a `_`-joined base62 string back into floats.
pub fn unpack(input: &str, scale: f64) -> Option<Vec<f64>> {
    if input.is_empty() {
        return Some(Vec::new());
    }
    input
        .split('_')
        .map(|part| base62::decode_i64(part).map(|v| v as f64 / scale))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_six_decimals() {
        let vector = vec![0.123456, -0.654321, 1.0, 0.0];
        let packed = pack(&vector, DEFAULT_SCALE);
        let unpacked = unpack(&packed, DEFAULT_SCALE).unwrap();
        for (a, b) in vector.iter().zip(unpacked.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn packed_form_is_smaller_than_json() {
        let vector: Vec<f64> = (0..64).map(|i| (i as f64) * 0.017_321).collect();
        let packed = pack(&vector, DEFAULT_SCALE);
        let json = serde_json::to_string(&vector).unwrap();
        assert!(packed.len() * 2 < json.len(), "{} vs {}", packed.len(), json.len());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(unpack("12_!!", DEFAULT_SCALE), None);
    }
}

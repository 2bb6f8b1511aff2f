//! Base62 integer codec
//!
//! Metadata header values are ASCII-limited and byte-budgeted, so integers
//! are stored in base62 (`0-9a-zA-Z`). Negative values carry a `-` prefix.

const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Encode an unsigned integer.
pub fn encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(ALPHABET[(value % 62) as usize]);
        value /= 62;
    }
    out.reverse();
    // alphabet bytes are ASCII
    String::from_utf8(out).unwrap()
}

/// Encode a signed integer, `-` prefix for negatives.
pub fn encode_i64(value: i64) -> String {
    if value < 0 {
        format!("-{}", encode_u64(value.unsigned_abs()))
    } else {
        encode_u64(value as u64)
    }
}

/// Encode a big-endian byte string as base62 (used for UUIDs).
pub fn encode_bytes(bytes: &[u8]) -> String {
    let mut value = u128::from_be_bytes({
        let mut buf = [0u8; 16];
        buf[16 - bytes.len()..].copy_from_slice(bytes);
        buf
    });
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(ALPHABET[(value % 62) as usize]);
        value /= 62;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

fn digit(byte: u8) -> Option<u64> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as u64),
        b'a'..=b'z' => Some((byte - b'a') as u64 + 10),
        b'A'..=b'Z' => Some((byte - b'A') as u64 + 36),
        _ => None,
    }
}

/// Decode an unsigned integer.
pub fn decode_u64(input: &str) -> Option<u64> {
    if input.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for byte in input.bytes() {
        value = value.checked_mul(62)?.checked_add(digit(byte)?)?;
    }
    Some(value)
}

/// Decode a signed integer.
pub fn decode_i64(input: &str) -> Option<i64> {
    if let Some(rest) = input.strip_prefix('-') {
        let magnitude = decode_u64(rest)?;
        if magnitude > i64::MIN.unsigned_abs() {
            return None;
        }
        Some((magnitude as i64).wrapping_neg())
    } else {
        let magnitude = decode_u64(input)?;
        i64::try_from(magnitude).ok()
    }
}

/// Decode base62 into a 16-byte big-endian buffer (UUID payloads).
pub fn decode_16_bytes(input: &str) -> Option<[u8; 16]> {
    if input.is_empty() {
        return None;
    }
    let mut value: u128 = 0;
    for byte in input.bytes() {
        value = value.checked_mul(62)?.checked_add(digit(byte)? as u128)?;
    }
    Some(value.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "0")]
    #[case(9, "9")]
    #[case(10, "a")]
    #[case(61, "Z")]
    #[case(62, "10")]
    #[case(3843, "ZZ")]
    fn encodes_known_values(#[case] value: u64, #[case] expected: &str) {
        assert_eq!(encode_u64(value), expected);
        assert_eq!(decode_u64(expected), Some(value));
    }

    #[test]
    fn signed_round_trip() {
        for value in [-1_000_000i64, -62, -1, 0, 1, 61, 62, i64::MAX, i64::MIN] {
            assert_eq!(decode_i64(&encode_i64(value)), Some(value));
        }
    }

    #[test]
    fn rejects_invalid_digits() {
        assert_eq!(decode_u64("a_b"), None);
        assert_eq!(decode_u64(""), None);
    }

    #[test]
    fn uuid_bytes_round_trip() {
        let id = uuid::Uuid::new_v4();
        let encoded = encode_bytes(id.as_bytes());
        assert!(encoded.len() <= 22);
        assert_eq!(decode_16_bytes(&encoded), Some(*id.as_bytes()));
    }
}

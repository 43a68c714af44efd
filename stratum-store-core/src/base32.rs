// omitted: E O U T
const BASE32_CHARS: &[u8] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Encoded length for a decoded byte count.
pub const fn encode_len(decoded: usize) -> usize {
    if decoded == 0 {
        0
    } else {
        (decoded * 8 - 1) / 5 + 1
    }
}

/// Encodes bytes to the store's base32 alphabet (least significant
/// character last, matching the reversed bit order used for path digests).
pub fn to_base32(bytes: &[u8]) -> String {
    let len = encode_len(bytes.len());

    let out: Vec<u8> = (0..len)
        .rev()
        .map(|n| {
            let b = n * 5;
            let i = b / 8;
            let j = b % 8;
            // bits from the lower byte
            let v1 = if i < bytes.len() {
                bytes[i].checked_shr(j as u32).unwrap_or(0)
            } else {
                0
            };
            // bits from the upper byte
            let v2 = if i + 1 < bytes.len() {
                bytes[i + 1].checked_shl((8 - j) as u32).unwrap_or(0)
            } else {
                0
            };
            BASE32_CHARS[((v1 | v2) & 0x1f) as usize]
        })
        .collect();

    String::from_utf8(out).expect("base32 alphabet is ASCII")
}

/// Decodes base32 text produced by [`to_base32`].
pub fn from_base32(input: &[u8]) -> Result<Vec<u8>, String> {
    let output_len = (input.len() * 5) / 8;
    let mut output = vec![0u8; output_len];

    for (i, &c) in input.iter().rev().enumerate() {
        let digit = BASE32_CHARS
            .iter()
            .position(|&b| b == c)
            .ok_or_else(|| format!("invalid base32 character: {}", c as char))?;

        let b = i * 5;
        let i = b / 8;
        let j = b % 8;

        if i < output_len {
            output[i] |= (digit as u8) << j;

            if i + 1 < output_len && j > 3 {
                output[i + 1] |= (digit as u8) >> (8 - j);
            }
        }
    }

    Ok(output)
}

/// Is `b` a character of the base32 alphabet?
pub fn is_base32_char(b: u8) -> bool {
    BASE32_CHARS.contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip() {
        let data = b"hello world";
        let encoded = to_base32(data);
        let decoded = from_base32(encoded.as_bytes()).unwrap();
        assert_eq!(data.to_vec(), decoded);
    }

    #[test]
    fn twenty_byte_digest_is_32_chars() {
        assert_eq!(encode_len(20), 32);
        assert_eq!(to_base32(&[0u8; 20]).len(), 32);
    }

    #[test]
    fn rejects_bad_character() {
        assert!(from_base32(b"e").is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let encoded = to_base32(&data);
            prop_assert_eq!(from_base32(encoded.as_bytes()).unwrap(), data);
        }
    }
}

//! Lowercase hex encoding for the ASCII line framings.

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut result = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        result.push(char::from_digit((b >> 4) as u32, 16).unwrap());
        result.push(char::from_digit((b & 0xf) as u32, 16).unwrap());
    }
    result
}

/// `None` on odd length or non-hex characters.
pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let digits = s
        .chars()
        .map(|c| c.to_digit(16))
        .collect::<Option<Vec<u32>>>()?;
    Some(
        digits
            .chunks(2)
            .map(|pair| ((pair[0] << 4) | pair[1]) as u8)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(&[], "")]
    #[case::single(&[0x7e], "7e")]
    #[case::mixed(&[0x00, 0xff, 0x1a, 0x20], "00ff1a20")]
    fn test_encode_decode(#[case] bytes: &[u8], #[case] hex: &str) {
        assert_eq!(hex_encode(bytes), hex);
        assert_eq!(hex_decode(hex), Some(bytes.to_vec()));
    }

    #[rstest]
    #[case::odd_length("abc")]
    #[case::not_hex("zz")]
    #[case::whitespace("ab cd")]
    fn test_decode_rejects(#[case] s: &str) {
        assert_eq!(hex_decode(s), None);
    }

    #[test]
    fn test_decode_uppercase() {
        assert_eq!(hex_decode("AB"), Some(vec![0xab]));
    }
}

//! Utility functions for the solamagic-ble crate.

use crate::error::{Error, Result};

/// Format bytes as a lowercase hex string without separators.
///
/// # Example
///
/// ```
/// use solamagic_ble::to_hex;
///
/// assert_eq!(to_hex(&[0x01, 0x64]), "0164");
/// ```
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a hex string into bytes.
///
/// Spaces, dashes and colons are ignored, so `"01 64"`, `"01-64"` and
/// `"0164"` all parse to the same payload.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] for an odd number of digits or a
/// non-hex character.
///
/// # Example
///
/// ```
/// use solamagic_ble::parse_hex;
///
/// assert_eq!(parse_hex("00 21").unwrap(), vec![0x00, 0x21]);
/// assert!(parse_hex("0g").is_err());
/// ```
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|c| !matches!(c, b' ' | b'-' | b':'))
        .collect();

    let invalid = || Error::InvalidParameter {
        name: "hex".to_string(),
        value: input.to_string(),
    };

    if digits.len() % 2 != 0 {
        return Err(invalid());
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).ok_or_else(invalid)?;
            let lo = (pair[1] as char).to_digit(16).ok_or_else(invalid)?;
            Ok((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[]), "");
        assert_eq!(
            to_hex(&[0xFF, 0xFF, 0xFF, 0xFD, 0x94, 0x34, 0x00, 0x00, 0x00]),
            "fffffffd9434000000"
        );
    }

    #[test]
    fn test_parse_hex_separators() {
        assert_eq!(parse_hex("01-42").unwrap(), vec![0x01, 0x42]);
        assert_eq!(parse_hex("AA:bb").unwrap(), vec![0xAA, 0xBB]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_parse_hex_rejects_garbage() {
        assert!(matches!(
            parse_hex("123"),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(parse_hex("zz"), Err(Error::InvalidParameter { .. })));
    }

    #[test]
    fn test_hex_roundtrip() {
        let payload = vec![0x14, 0x20, 0x03, 0x7E];
        assert_eq!(parse_hex(&to_hex(&payload)).unwrap(), payload);
    }
}

//! # Encoding Module
//!
//! Conversions between raw serial bytes and the text the AT protocol speaks.

/// Decodes modem output as UTF-8, replacing invalid sequences.
///
/// # Examples
///
/// ```
/// use modem_sms::serial::encoding::decode_text;
///
/// assert_eq!(decode_text(b"+CMGS: 12\r\n"), "+CMGS: 12\r\n");
/// ```
#[must_use]
pub fn decode_text(source_data: &[u8]) -> String {
    String::from_utf8_lossy(source_data).into_owned()
}

/// Renders bytes as space separated hex pairs for trace logs.
///
/// # Examples
///
/// ```
/// use modem_sms::serial::encoding::hex_dump;
///
/// assert_eq!(hex_dump(b"AT\r"), "41 54 0d");
/// ```
#[must_use]
pub fn hex_dump(source_data: &[u8]) -> String {
    source_data
        .chunks(1)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ascii() {
        assert_eq!(decode_text(b"OK\r\n"), "OK\r\n");
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let result = decode_text(&[b'O', 0xFF, b'K']);
        assert!(result.starts_with('O'));
        assert!(result.ends_with('K'));
        assert!(result.contains('\u{FFFD}'));
    }

    #[test]
    fn test_hex_dump_ctrl_z() {
        assert_eq!(hex_dump(&[0x1A]), "1a");
    }

    #[test]
    fn test_hex_dump_empty() {
        assert_eq!(hex_dump(&[]), "");
    }
}

//! Receptor wire protocol - peripheral identity and notification payloads
//!
//! The peripheral firmware exposes one service with one notifiable
//! characteristic. Every notification carries the current value as UTF-8
//! text, there is no framing on top of GATT.

pub mod ble;

/// Decode a notification payload into display text.
///
/// Malformed UTF-8 sequences are replaced with U+FFFD rather than rejected,
/// the peripheral is trusted to send text.
pub fn decode_value(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

#[cfg(test)]
mod tests {
    use super::decode_value;

    #[test]
    fn decodes_ascii_digits() {
        assert_eq!(decode_value(b"42"), "42");
    }

    #[test]
    fn decodes_multibyte_text() {
        assert_eq!(decode_value("número 7".as_bytes()), "número 7");
    }

    #[test]
    fn malformed_bytes_become_replacement_chars() {
        assert_eq!(decode_value(&[b'1', 0xff, b'2']), "1\u{fffd}2");
    }

    #[test]
    fn empty_payload_is_empty_text() {
        assert_eq!(decode_value(&[]), "");
    }
}

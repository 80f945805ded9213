//! Malformed payload handling: truncation, unknown tags, trailing bytes.

#[cfg(test)]
mod tests {
    use crate::encoding::EncodingError;
    use crate::value::{Value, pack, unpack};

    #[test]
    fn unknown_tag_rejected() {
        let err = unpack(&[0x7F]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidTag { .. }));
    }

    #[test]
    fn empty_buffer_rejected() {
        assert!(unpack(&[]).is_err());
    }

    #[test]
    fn truncated_int_rejected() {
        // Int tag followed by only 4 of 8 bytes.
        assert!(unpack(&[0x02, 1, 2, 3, 4]).is_err());
    }

    #[test]
    fn truncated_string_rejected() {
        // Str tag claiming 10 bytes, providing 2.
        let mut buf = vec![0x04];
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(b"ab");
        assert!(unpack(&buf).is_err());
    }

    #[test]
    fn truncated_map_entry_rejected() {
        // Map with a declared entry whose value is missing.
        let mut buf = vec![0x07];
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(b'k');
        assert!(unpack(&buf).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut buf = pack(&Value::Bool(true)).unwrap();
        buf.push(0x00);
        assert!(unpack(&buf).is_err());
    }

    #[test]
    fn list_count_overflow_rejected() {
        let mut buf = vec![0x06];
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            unpack(&buf),
            Err(EncodingError::LengthOverflow(_))
        ));
    }
}

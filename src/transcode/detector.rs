//! Encoding classification

/// UTF-8 byte-order mark
pub const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Encoding of a byte buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingKind {
    Utf8,
    /// Anything that fails strict UTF-8 validation
    Legacy,
}

/// Classify a buffer as UTF-8 or legacy-encoded.
///
/// A BOM prefix wins outright; otherwise the whole buffer must validate
/// as UTF-8. Nothing is decoded.
pub fn detect(data: &[u8]) -> EncodingKind {
    if data.starts_with(UTF8_BOM) {
        return EncodingKind::Utf8;
    }

    if std::str::from_utf8(data).is_ok() {
        return EncodingKind::Utf8;
    }

    EncodingKind::Legacy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bom_is_utf8() {
        // BOM followed by invalid UTF-8 is still classified by the BOM
        let data = [0xEF, 0xBB, 0xBF, 0xC4, 0xE3];
        assert_eq!(detect(&data), EncodingKind::Utf8);
    }

    #[test]
    fn test_valid_utf8() {
        assert_eq!(detect("你好, world".as_bytes()), EncodingKind::Utf8);
        assert_eq!(detect(b"plain ascii"), EncodingKind::Utf8);
        assert_eq!(detect(b""), EncodingKind::Utf8);
    }

    #[test]
    fn test_gb18030_is_legacy() {
        assert_eq!(detect(&[0xC4, 0xE3, 0xBA, 0xC3]), EncodingKind::Legacy);
    }

    #[test]
    fn test_truncated_utf8_is_legacy() {
        let mut data = "你好".as_bytes().to_vec();
        data.pop();
        assert_eq!(detect(&data), EncodingKind::Legacy);
    }
}

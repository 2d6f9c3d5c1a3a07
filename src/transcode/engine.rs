//! Whole-buffer conversion between UTF-8 and the legacy encoding

use super::detector::{detect, EncodingKind, UTF8_BOM};
use crate::error::{Error, Result};

/// The legacy encoding assumed for any content that is not UTF-8
pub use encoding_rs::GB18030 as LEGACY_ENCODING;

/// Bring a physical buffer into UTF-8.
///
/// UTF-8 input only loses its BOM; legacy input is decoded in full and
/// fails on any sequence GB18030 cannot decode.
pub fn normalize_to_utf8(data: &[u8]) -> Result<Vec<u8>> {
    match detect(data) {
        EncodingKind::Utf8 => Ok(data.strip_prefix(UTF8_BOM).unwrap_or(data).to_vec()),
        EncodingKind::Legacy => LEGACY_ENCODING
            .decode_without_bom_handling_and_without_replacement(data)
            .map(|text| text.into_owned().into_bytes())
            .ok_or_else(|| {
                Error::Decode(format!(
                    "{} bytes are not valid {}",
                    data.len(),
                    LEGACY_ENCODING.name()
                ))
            }),
    }
}

/// Encode a UTF-8 buffer into the legacy encoding
pub fn convert_from_utf8(data: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(data).map_err(|e| {
        Error::Encode(format!(
            "buffer is not valid UTF-8 after byte {}",
            e.valid_up_to()
        ))
    })?;

    let (encoded, _, had_errors) = LEGACY_ENCODING.encode(text);
    if had_errors {
        let culprit = text
            .chars()
            .find(|c| {
                let mut buf = [0u8; 4];
                LEGACY_ENCODING.encode(c.encode_utf8(&mut buf)).2
            })
            .map(|c| format!("U+{:04X}", c as u32))
            .unwrap_or_else(|| "unknown character".to_string());
        return Err(Error::Encode(format!(
            "{} is not representable in {}",
            culprit,
            LEGACY_ENCODING.name()
        )));
    }

    Ok(encoded.into_owned())
}

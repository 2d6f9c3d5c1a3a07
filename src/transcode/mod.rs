//! Legacy encoding detection and transcoding
//!
//! Content is either UTF-8 or GB18030 (a superset of GBK/GB2312).
//! Conversion always works on whole buffers; the streaming decoder is
//! kept for sequential readers.

mod detector;
mod engine;
mod stream;

pub use detector::{detect, EncodingKind, UTF8_BOM};
pub use engine::{convert_from_utf8, normalize_to_utf8, LEGACY_ENCODING};
pub use stream::{decode_stream, DecodeReader};

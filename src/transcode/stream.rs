//! Lazy legacy-to-UTF-8 decoding over a reader

use super::engine::LEGACY_ENCODING;
use encoding_rs::{Decoder, DecoderResult};
use std::io::{self, Read};

const CHUNK_SIZE: usize = 8 * 1024;

/// Reader adapter producing UTF-8 from a legacy-encoded source.
///
/// Single pass only; once the source is exhausted or a malformed
/// sequence is hit the reader stays in that state.
pub struct DecodeReader<R: Read> {
    inner: R,
    decoder: Decoder,
    input: Vec<u8>,
    output: Vec<u8>,
    output_pos: usize,
    finished: bool,
    failed: bool,
}

/// Wrap a legacy-encoded source in a lazily decoding reader
pub fn decode_stream<R: Read>(source: R) -> DecodeReader<R> {
    DecodeReader {
        inner: source,
        decoder: LEGACY_ENCODING.new_decoder_without_bom_handling(),
        input: vec![0u8; CHUNK_SIZE],
        output: Vec::new(),
        output_pos: 0,
        finished: false,
        failed: false,
    }
}

impl<R: Read> DecodeReader<R> {
    /// Decode the next chunk of input into the output buffer
    fn fill(&mut self) -> io::Result<()> {
        let n = loop {
            match self.inner.read(&mut self.input) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        let last = n == 0;

        let capacity = self
            .decoder
            .max_utf8_buffer_length_without_replacement(n)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "decode buffer overflow"))?;
        self.output.clear();
        self.output.resize(capacity, 0);
        self.output_pos = 0;

        let mut consumed = 0;
        let mut written = 0;
        loop {
            let (result, read, wrote) = self.decoder.decode_to_utf8_without_replacement(
                &self.input[consumed..n],
                &mut self.output[written..],
                last,
            );
            consumed += read;
            written += wrote;

            match result {
                DecoderResult::InputEmpty => break,
                DecoderResult::OutputFull => {
                    let grow = self.output.len().max(16);
                    self.output.resize(self.output.len() + grow, 0);
                }
                DecoderResult::Malformed(_, _) => {
                    self.failed = true;
                    return Err(malformed());
                }
            }
        }

        self.output.truncate(written);
        self.finished = last;
        Ok(())
    }
}

impl<R: Read> Read for DecodeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.failed {
                return Err(malformed());
            }

            if self.output_pos < self.output.len() {
                let available = &self.output[self.output_pos..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.output_pos += n;
                return Ok(n);
            }

            if self.finished {
                return Ok(0);
            }

            self.fill()?;
        }
    }
}

fn malformed() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed {} sequence", LEGACY_ENCODING.name()),
    )
}

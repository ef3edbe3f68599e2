//! Windowed binary delta codec.
//!
//! Representations store their content as a delta against a base
//! representation (or against the empty stream, a "self-delta"). The codec
//! splits the target into fixed-size windows, pairs window `i` of the target
//! with window `i` of the expanded source, and encodes each window as a
//! copy-prefix / literal / copy-suffix instruction sequence. That makes
//! small in-place edits cheap while keeping the decoder a single forward
//! pass.
//!
//! ## Payload format
//!
//! ```text
//! "DLT1"  version:u8  window*
//! window = src_offset:varint  src_len:varint  tgt_len:varint  op*
//! op     = 0x00 copy  src_rel:varint  len:varint
//!        | 0x01 data  len:varint  bytes[len]
//! ```
//!
//! Ops of a window produce exactly `tgt_len` bytes; anything else is
//! corruption. Varints are unsigned LEB128.

use std::io::Write;

use fsvn_error::{FsError, Result};

/// Payload magic.
pub const MAGIC: &[u8; 4] = b"DLT1";
/// Current payload version.
pub const VERSION: u8 = 1;
/// Window size: source and target are processed in chunks of this many
/// expanded bytes.
pub const WINDOW_SIZE: usize = 64 * 1024;

const OP_COPY: u8 = 0x00;
const OP_DATA: u8 = 0x01;

fn write_varint<W: Write>(out: &mut W, mut value: u64) -> Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.write_all(&[byte])?;
            return Ok(());
        }
        out.write_all(&[byte | 0x80])?;
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| FsError::corrupt("truncated delta payload"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| FsError::corrupt("truncated delta payload"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            if shift >= 64 {
                return Err(FsError::corrupt("delta varint overflow"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[u8], b: &[u8], max: usize) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take(max)
        .take_while(|(x, y)| x == y)
        .count()
}

/// Streaming delta encoder.
///
/// Feed target bytes with [`write`](Self::write); every full window is
/// encoded and flushed to the output immediately. [`finish`](Self::finish)
/// flushes the trailing partial window and must be called exactly once.
pub struct DeltaEncoder<W: Write> {
    out: W,
    source: Vec<u8>,
    window: Vec<u8>,
    /// Index of the window currently being accumulated.
    window_index: usize,
}

impl<W: Write> DeltaEncoder<W> {
    /// Start encoding against `source` (pass an empty buffer for a
    /// self-delta). Writes the payload header eagerly.
    pub fn new(mut out: W, source: Vec<u8>) -> Result<Self> {
        out.write_all(MAGIC)?;
        out.write_all(&[VERSION])?;
        Ok(Self {
            out,
            source,
            window: Vec::with_capacity(WINDOW_SIZE),
            window_index: 0,
        })
    }

    /// Append target bytes.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = WINDOW_SIZE - self.window.len();
            let take = room.min(data.len());
            self.window.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.window.len() == WINDOW_SIZE {
                self.flush_window()?;
            }
        }
        Ok(())
    }

    /// Flush the trailing window and return the output writer.
    pub fn finish(mut self) -> Result<W> {
        if !self.window.is_empty() {
            self.flush_window()?;
        }
        Ok(self.out)
    }

    fn flush_window(&mut self) -> Result<()> {
        let src_offset = self.window_index * WINDOW_SIZE;
        let src_window = if src_offset < self.source.len() {
            let end = (src_offset + WINDOW_SIZE).min(self.source.len());
            &self.source[src_offset..end]
        } else {
            &[]
        };
        let target = &self.window;

        write_varint(&mut self.out, src_offset as u64)?;
        write_varint(&mut self.out, src_window.len() as u64)?;
        write_varint(&mut self.out, target.len() as u64)?;

        let prefix = common_prefix(src_window, target);
        let suffix = common_suffix(
            &src_window[prefix..],
            &target[prefix..],
            (src_window.len() - prefix).min(target.len() - prefix),
        );
        // A window identical to its source collapses to one copy op.
        if prefix > 0 {
            self.out.write_all(&[OP_COPY])?;
            write_varint(&mut self.out, 0)?;
            write_varint(&mut self.out, prefix as u64)?;
        }
        let middle = &target[prefix..target.len() - suffix];
        if !middle.is_empty() {
            self.out.write_all(&[OP_DATA])?;
            write_varint(&mut self.out, middle.len() as u64)?;
            self.out.write_all(middle)?;
        }
        if suffix > 0 {
            self.out.write_all(&[OP_COPY])?;
            write_varint(&mut self.out, (src_window.len() - suffix) as u64)?;
            write_varint(&mut self.out, suffix as u64)?;
        }

        self.window.clear();
        self.window_index += 1;
        Ok(())
    }
}

/// One-shot convenience encoder.
pub fn encode(source: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeltaEncoder::new(Vec::new(), source.to_vec())?;
    encoder.write(target)?;
    encoder.finish()
}

/// Expand `payload` against the fully expanded `source`.
pub fn decode(source: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut reader = Reader::new(payload);
    if reader.bytes(4)? != MAGIC {
        return Err(FsError::corrupt("bad delta payload magic"));
    }
    let version = reader.byte()?;
    if version != VERSION {
        return Err(FsError::corrupt(format!(
            "unsupported delta payload version {version}"
        )));
    }

    let mut target = Vec::new();
    while !reader.at_end() {
        let src_offset = usize::try_from(reader.varint()?)
            .map_err(|_| FsError::corrupt("delta window offset out of range"))?;
        let src_len = usize::try_from(reader.varint()?)
            .map_err(|_| FsError::corrupt("delta window length out of range"))?;
        let tgt_len = usize::try_from(reader.varint()?)
            .map_err(|_| FsError::corrupt("delta window length out of range"))?;
        let src_window = source
            .get(src_offset..src_offset.checked_add(src_len).unwrap_or(usize::MAX))
            .ok_or_else(|| FsError::corrupt("delta window outside source"))?;

        let mut produced = 0usize;
        while produced < tgt_len {
            match reader.byte()? {
                OP_COPY => {
                    let rel = usize::try_from(reader.varint()?)
                        .map_err(|_| FsError::corrupt("delta copy offset out of range"))?;
                    let len = usize::try_from(reader.varint()?)
                        .map_err(|_| FsError::corrupt("delta copy length out of range"))?;
                    let chunk = src_window
                        .get(rel..rel.checked_add(len).unwrap_or(usize::MAX))
                        .ok_or_else(|| FsError::corrupt("delta copy outside source window"))?;
                    target.extend_from_slice(chunk);
                    produced += len;
                }
                OP_DATA => {
                    let len = usize::try_from(reader.varint()?)
                        .map_err(|_| FsError::corrupt("delta literal length out of range"))?;
                    target.extend_from_slice(reader.bytes(len)?);
                    produced += len;
                }
                op => return Err(FsError::corrupt(format!("unknown delta op 0x{op:02x}"))),
            }
        }
        if produced != tgt_len {
            return Err(FsError::corrupt("delta window produced wrong length"));
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn self_delta_round_trip() {
        let target = b"hello\n";
        let payload = encode(&[], target).unwrap();
        assert_eq!(decode(&[], &payload).unwrap(), target);
    }

    #[test]
    fn empty_target() {
        let payload = encode(b"anything", &[]).unwrap();
        assert_eq!(payload.len(), 5); // header only, no windows
        assert_eq!(decode(b"anything", &payload).unwrap(), b"");
    }

    #[test]
    fn identical_content_collapses_to_copy() {
        let content = vec![7u8; 10_000];
        let payload = encode(&content, &content).unwrap();
        // One copy op per window, no literal bytes.
        assert!(payload.len() < 32);
        assert_eq!(decode(&content, &payload).unwrap(), content);
    }

    #[test]
    fn small_edit_stays_small() {
        let mut source = vec![0u8; 50_000];
        source[40_000] = 9;
        let mut target = source.clone();
        target[100] = 1;
        let payload = encode(&source, &target).unwrap();
        assert!(payload.len() < 64, "payload was {} bytes", payload.len());
        assert_eq!(decode(&source, &payload).unwrap(), target);
    }

    #[test]
    fn multi_window_round_trip() {
        let source: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut target = source.clone();
        target[WINDOW_SIZE + 17] ^= 0xff;
        target.extend_from_slice(b"tail growth");
        let payload = encode(&source, &target).unwrap();
        assert_eq!(decode(&source, &payload).unwrap(), target);
    }

    #[test]
    fn corrupt_payloads_are_rejected() {
        assert!(decode(&[], b"").is_err());
        assert!(decode(&[], b"DLT9\x01").is_err());
        assert!(decode(&[], b"DLT1\x02").is_err());
        let mut payload = encode(&[], b"abc").unwrap();
        payload.truncate(payload.len() - 1);
        assert!(decode(&[], &payload).is_err());
    }

    proptest! {
        #[test]
        fn round_trip(source in proptest::collection::vec(any::<u8>(), 0..4096),
                      target in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let payload = encode(&source, &target).unwrap();
            prop_assert_eq!(decode(&source, &payload).unwrap(), target);
        }

        #[test]
        fn streaming_matches_one_shot(target in proptest::collection::vec(any::<u8>(), 0..8192),
                                      chunk in 1usize..512) {
            let source = b"base content that repeats; base content that repeats";
            let mut encoder = DeltaEncoder::new(Vec::new(), source.to_vec()).unwrap();
            for piece in target.chunks(chunk) {
                encoder.write(piece).unwrap();
            }
            let streamed = encoder.finish().unwrap();
            prop_assert_eq!(streamed, encode(source, &target).unwrap());
        }
    }
}

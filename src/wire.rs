//! Compact wire format for reconstructed traces
//!
//! A trace is encoded frame by frame with no header or count:
//!
//! ```text
//! call frame:  0x01 | u16 BE len | declaring name (UTF-8)
//!                   | u16 BE len | operation name (UTF-8)
//!                   | i32 BE line
//! boundary:    0x00
//! ```
//!
//! File names are not part of the format; decoded frames never carry one.

use crate::frame::{CallSite, Frame};
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;

const TAG_BOUNDARY: u8 = 0x00;
const TAG_CALL: u8 = 0x01;

/// Errors produced while encoding or decoding the wire format
#[derive(Error, Debug)]
pub enum WireError {
    #[error("name of {len} bytes exceeds the 65535 byte limit")]
    NameTooLong { len: usize },

    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("invalid frame tag {tag:#04x} at offset {offset}")]
    InvalidTag { tag: u8, offset: usize },

    #[error("invalid UTF-8 in name at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Write one frame
pub fn write_frame<W: Write>(out: &mut W, frame: &Frame) -> Result<(), WireError> {
    match frame {
        Frame::Boundary => out.write_all(&[TAG_BOUNDARY])?,
        Frame::Call(site) => {
            out.write_all(&[TAG_CALL])?;
            write_name(out, &site.declaring_name)?;
            write_name(out, &site.operation_name)?;
            out.write_all(&site.line.to_be_bytes())?;
        }
    }
    Ok(())
}

fn write_name<W: Write>(out: &mut W, name: &str) -> Result<(), WireError> {
    let len = u16::try_from(name.len()).map_err(|_| WireError::NameTooLong { len: name.len() })?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(name.as_bytes())?;
    Ok(())
}

/// Write every frame in order
pub fn write_frames<W: Write>(out: &mut W, frames: &[Frame]) -> Result<(), WireError> {
    for frame in frames {
        write_frame(out, frame)?;
    }
    Ok(())
}

/// Encode a trace into a fresh buffer
///
/// # Example
///
/// ```
/// use hilvan::frame::Frame;
/// use hilvan::wire;
///
/// let bytes = wire::encode(&[Frame::Boundary]).unwrap();
/// assert_eq!(bytes, vec![0x00]);
/// ```
pub fn encode(frames: &[Frame]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(frames.len() * 32);
    write_frames(&mut out, frames)?;
    Ok(out)
}

/// Decode a complete buffer into frames
pub fn decode(bytes: &[u8]) -> Result<Vec<Frame>, WireError> {
    let mut reader = Reader { bytes, offset: 0 };
    let mut frames = Vec::new();
    while !reader.is_done() {
        frames.push(reader.frame()?);
    }
    Ok(frames)
}

/// Cursor over an encoded buffer
pub(crate) struct Reader<'a> {
    pub(crate) bytes: &'a [u8],
    pub(crate) offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn is_done(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(WireError::UnexpectedEof { offset: self.bytes.len() })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn name(&mut self) -> Result<Arc<str>, WireError> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        let offset = self.offset;
        let raw = self.take(len)?;
        let name = std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8 { offset })?;
        Ok(Arc::from(name))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub(crate) fn frame(&mut self) -> Result<Frame, WireError> {
        let offset = self.offset;
        let [tag] = self.array::<1>()?;
        match tag {
            TAG_BOUNDARY => Ok(Frame::Boundary),
            TAG_CALL => {
                let declaring_name = self.name()?;
                let operation_name = self.name()?;
                let line = self.i32()?;
                Ok(Frame::Call(CallSite {
                    declaring_name,
                    operation_name,
                    file_name: None,
                    line,
                }))
            }
            tag => Err(WireError::InvalidTag { tag, offset }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_call_frame_layout() {
        let bytes = encode(&[Frame::call("ab", "c", 258)]).unwrap();
        assert_eq!(
            bytes,
            vec![0x01, 0x00, 0x02, b'a', b'b', 0x00, 0x01, b'c', 0x00, 0x00, 0x01, 0x02]
        );
    }

    #[test]
    fn test_encode_negative_line() {
        let bytes = encode(&[Frame::call("", "", -1)]).unwrap();
        assert_eq!(bytes, vec![0x01, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_round_trip_with_boundaries() {
        let frames = vec![
            Frame::call("app::Worker", "run", 12),
            Frame::Boundary,
            Frame::call("app", "main", -1),
            Frame::call("ünïcödé::Ty", "fn", i32::MAX),
        ];
        assert_eq!(decode(&encode(&frames).unwrap()).unwrap(), frames);
    }

    #[test]
    fn test_file_names_dropped() {
        let frame = Frame::from_symbol("app::run", Some("src/app.rs"), Some(4));
        let decoded = decode(&encode(&[frame]).unwrap()).unwrap();
        assert_eq!(decoded, vec![Frame::call("app", "run", 4)]);
    }

    #[test]
    fn test_empty_input() {
        assert!(decode(&[]).unwrap().is_empty());
        assert!(encode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_name_too_long() {
        let long = "x".repeat(70_000);
        let err = encode(&[Frame::call(&long, "op", 1)]).unwrap_err();
        assert!(matches!(err, WireError::NameTooLong { len: 70_000 }));
    }

    #[test]
    fn test_max_length_name_fits() {
        let name = "y".repeat(u16::MAX as usize);
        let frames = vec![Frame::call(&name, "op", 1)];
        assert_eq!(decode(&encode(&frames).unwrap()).unwrap(), frames);
    }

    #[test]
    fn test_invalid_tag() {
        let err = decode(&[0x00, 0x07]).unwrap_err();
        assert!(matches!(err, WireError::InvalidTag { tag: 0x07, offset: 1 }));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode(&[Frame::call("abc", "def", 1)]).unwrap();
        for cut in 1..bytes.len() {
            let err = decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, WireError::UnexpectedEof { .. }), "cut at {}", cut);
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = vec![0x01, 0x00, 0x01, 0xff, 0x00, 0x00, 0, 0, 0, 0];
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, WireError::InvalidUtf8 { offset: 3 }));
    }

    #[test]
    fn test_write_to_failing_writer() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = write_frame(&mut Broken, &Frame::Boundary).unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }
}

//! Byte encoding for records persisted in generation frames.
//!
//! Frames are read whole before decoding, so both traits work on in-memory
//! buffers. Multi-byte integers are little endian.

mod num;
mod option;
mod string;

use thiserror::Error;

/// Value that can be written into a generation frame.
pub trait Encode {
    /// Append the encoded form of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Exact number of bytes `encode` appends.
    fn size(&self) -> usize;
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buf: &mut Vec<u8>) {
        Encode::encode(*self, buf)
    }

    fn size(&self) -> usize {
        Encode::size(*self)
    }
}

/// Inverse of [`Encode`].
pub trait Decode: Sized {
    /// Decode one value from the front of `reader`, advancing it.
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError>;
}

/// Malformed frame contents.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended early.
    #[error("decode error: truncated input, needed {needed} bytes, {remaining} left")]
    Truncated {
        /// Bytes the value needed.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },
    /// An enum tag outside the known range.
    #[error("decode error: unknown {what} tag {tag}")]
    UnknownTag {
        /// Type being decoded.
        what: &'static str,
        /// Tag found in the input.
        tag: u8,
    },
    /// A string that is not UTF-8.
    #[error("decode error: invalid utf8 string")]
    Utf8,
}

/// Split `len` bytes off the front of `reader`.
pub(crate) fn take<'a>(reader: &mut &'a [u8], len: usize) -> Result<&'a [u8], DecodeError> {
    if reader.len() < len {
        return Err(DecodeError::Truncated {
            needed: len,
            remaining: reader.len(),
        });
    }
    let (head, tail) = reader.split_at(len);
    *reader = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair(u32, String);

    impl Encode for Pair {
        fn encode(&self, buf: &mut Vec<u8>) {
            self.0.encode(buf);
            self.1.encode(buf);
        }

        fn size(&self) -> usize {
            self.0.size() + self.1.size()
        }
    }

    impl Decode for Pair {
        fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
            Ok(Pair(u32::decode(reader)?, String::decode(reader)?))
        }
    }

    #[test]
    fn encode_decode_struct() {
        let pair = Pair(42, "hello".to_string());
        let mut buf = Vec::new();
        pair.encode(&mut buf);
        assert_eq!(buf.len(), pair.size());

        let mut reader = buf.as_slice();
        let decoded = Pair::decode(&mut reader).unwrap();
        assert_eq!(decoded.0, 42);
        assert_eq!(decoded.1, "hello");
        assert!(reader.is_empty());
    }

    #[test]
    fn truncated_input_is_reported() {
        let mut reader: &[u8] = &[1, 2];
        assert_eq!(
            u64::decode(&mut reader),
            Err(DecodeError::Truncated {
                needed: 8,
                remaining: 2
            })
        );
    }
}

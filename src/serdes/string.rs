use std::mem::size_of;

use bytes::Bytes;

use super::{take, Decode, DecodeError, Encode};

impl Encode for str {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        buf.extend_from_slice(self.as_bytes());
    }

    fn size(&self) -> usize {
        size_of::<u32>() + self.len()
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_str().encode(buf)
    }

    fn size(&self) -> usize {
        self.as_str().size()
    }
}

impl Decode for String {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = u32::decode(reader)? as usize;
        let raw = take(reader, len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8)
    }
}

impl Encode for [u8] {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        buf.extend_from_slice(self);
    }

    fn size(&self) -> usize {
        size_of::<u32>() + self.len()
    }
}

impl Encode for Bytes {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_ref().encode(buf)
    }

    fn size(&self) -> usize {
        self.as_ref().size()
    }
}

impl Decode for Bytes {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = u32::decode(reader)? as usize;
        Ok(Bytes::copy_from_slice(take(reader, len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_bytes() {
        let mut buf = Vec::new();
        "stratum".to_string().encode(&mut buf);
        Bytes::from_static(b"\x00\xff").encode(&mut buf);

        let mut reader = buf.as_slice();
        assert_eq!(String::decode(&mut reader).unwrap(), "stratum");
        assert_eq!(Bytes::decode(&mut reader).unwrap().as_ref(), b"\x00\xff");
        assert!(reader.is_empty());
    }

    #[test]
    fn invalid_utf8() {
        let mut buf = Vec::new();
        [0xffu8, 0xfe].as_slice().encode(&mut buf);
        let mut reader = buf.as_slice();
        assert_eq!(String::decode(&mut reader), Err(DecodeError::Utf8));
    }
}

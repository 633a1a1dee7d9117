use std::mem::size_of;

use ulid::Ulid;

use super::{take, Decode, DecodeError, Encode};
use crate::mvcc::SequenceNumber;

macro_rules! implement_encode_decode {
    ($struct_name:ident) => {
        impl Encode for $struct_name {
            fn encode(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }

            fn size(&self) -> usize {
                size_of::<Self>()
            }
        }

        impl Decode for $struct_name {
            fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
                let mut raw = [0u8; size_of::<Self>()];
                raw.copy_from_slice(take(reader, size_of::<Self>())?);
                Ok(Self::from_le_bytes(raw))
            }
        }
    };
}

implement_encode_decode!(u8);
implement_encode_decode!(u16);
implement_encode_decode!(u32);
implement_encode_decode!(u64);
implement_encode_decode!(i64);
implement_encode_decode!(f64);

impl Encode for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }

    fn size(&self) -> usize {
        1
    }
}

impl Decode for bool {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::UnknownTag { what: "bool", tag }),
        }
    }
}

impl Encode for SequenceNumber {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.get().encode(buf)
    }

    fn size(&self) -> usize {
        size_of::<u64>()
    }
}

impl Decode for SequenceNumber {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        u64::decode(reader).map(SequenceNumber::new)
    }
}

impl Encode for Ulid {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_bytes());
    }

    fn size(&self) -> usize {
        16
    }
}

impl Decode for Ulid {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(take(reader, 16)?);
        Ok(Ulid::from_bytes(raw))
    }
}

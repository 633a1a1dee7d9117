use super::{Decode, DecodeError, Encode};

impl<V> Encode for Option<V>
where
    V: Encode,
{
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            None => buf.push(0),
            Some(v) => {
                buf.push(1);
                v.encode(buf);
            }
        }
    }

    fn size(&self) -> usize {
        match self {
            None => 1,
            Some(v) => 1 + v.size(),
        }
    }
}

impl<V> Decode for Option<V>
where
    V: Decode,
{
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(reader)? {
            0 => Ok(None),
            1 => Ok(Some(V::decode(reader)?)),
            tag => Err(DecodeError::UnknownTag { what: "option", tag }),
        }
    }
}

//! Typed composite keys.
//!
//! A [`Key`] is an ordered tuple of [`Field`]s compared lexicographically; a
//! strict prefix orders before every key it prefixes. Each field carries its
//! own direction: wrapping a field in [`Field::Desc`] reverses its order
//! without affecting the fields around it. An [`IndexKey`] qualifies a key with
//! the index it belongs to so that different indexes never interleave.

mod pattern;

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use bytes::Bytes;
use ulid::Ulid;

pub use pattern::{KeyPattern, KeyRange, KeyScope, PatternField};

use crate::{
    id::IndexId,
    serdes::{Decode, DecodeError, Encode},
};

/// One component of a [`Key`].
#[derive(Clone)]
pub enum Field {
    /// Boolean, `false` first.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Ordered with `f64::total_cmp`, so `NaN` has a fixed position.
    Real(f64),
    /// UTF-8 string, ordered bytewise.
    Str(String),
    /// Raw bytes, ordered lexicographically.
    Bytes(Bytes),
    /// Identifier, ordered like its 128-bit value.
    Id(Ulid),
    /// Descending component: orders opposite to the wrapped field.
    Desc(Box<Field>),
}

impl Field {
    /// Wrap `field` so that it sorts in descending order.
    pub fn desc(field: impl Into<Field>) -> Self {
        Field::Desc(Box::new(field.into()))
    }

    fn tag(&self) -> u8 {
        match self {
            Field::Bool(_) => 0,
            Field::Int(_) => 1,
            Field::Real(_) => 2,
            Field::Str(_) => 3,
            Field::Bytes(_) => 4,
            Field::Id(_) => 5,
            Field::Desc(_) => 6,
        }
    }

    /// The integer of an `Int` field.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The string of a `Str` field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Approximate in-memory footprint, used by the size seal trigger.
    pub fn heap_size(&self) -> usize {
        match self {
            Field::Bool(_) => 1,
            Field::Int(_) | Field::Real(_) => 8,
            Field::Str(v) => v.len(),
            Field::Bytes(v) => v.len(),
            Field::Id(_) => 16,
            Field::Desc(inner) => inner.heap_size(),
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Field {}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Field::Bool(a), Field::Bool(b)) => a.cmp(b),
            (Field::Int(a), Field::Int(b)) => a.cmp(b),
            (Field::Real(a), Field::Real(b)) => a.total_cmp(b),
            (Field::Str(a), Field::Str(b)) => a.cmp(b),
            (Field::Bytes(a), Field::Bytes(b)) => a.cmp(b),
            (Field::Id(a), Field::Id(b)) => a.cmp(b),
            (Field::Desc(a), Field::Desc(b)) => b.cmp(a),
            (a, b) => a.tag().cmp(&b.tag()),
        }
    }
}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            Field::Bool(v) => v.hash(state),
            Field::Int(v) => v.hash(state),
            Field::Real(v) => v.to_bits().hash(state),
            Field::Str(v) => v.hash(state),
            Field::Bytes(v) => v.hash(state),
            Field::Id(v) => v.hash(state),
            Field::Desc(inner) => inner.hash(state),
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Bool(v) => write!(f, "{v}"),
            Field::Int(v) => write!(f, "{v}"),
            Field::Real(v) => write!(f, "{v:?}"),
            Field::Str(v) => write!(f, "{v:?}"),
            Field::Bytes(v) => write!(f, "{v:?}"),
            Field::Id(v) => write!(f, "{v}"),
            Field::Desc(inner) => write!(f, "desc({inner:?})"),
        }
    }
}

impl From<bool> for Field {
    fn from(value: bool) -> Self {
        Field::Bool(value)
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Int(value)
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Field::Real(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Str(value.to_string())
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Str(value)
    }
}

impl From<Bytes> for Field {
    fn from(value: Bytes) -> Self {
        Field::Bytes(value)
    }
}

impl From<Ulid> for Field {
    fn from(value: Ulid) -> Self {
        Field::Id(value)
    }
}

impl Encode for Field {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag());
        match self {
            Field::Bool(v) => v.encode(buf),
            Field::Int(v) => v.encode(buf),
            Field::Real(v) => v.encode(buf),
            Field::Str(v) => v.encode(buf),
            Field::Bytes(v) => v.encode(buf),
            Field::Id(v) => v.encode(buf),
            Field::Desc(inner) => inner.encode(buf),
        }
    }

    fn size(&self) -> usize {
        1 + match self {
            Field::Bool(v) => v.size(),
            Field::Int(v) => v.size(),
            Field::Real(v) => v.size(),
            Field::Str(v) => v.size(),
            Field::Bytes(v) => v.size(),
            Field::Id(v) => v.size(),
            Field::Desc(inner) => inner.size(),
        }
    }
}

impl Decode for Field {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(match u8::decode(reader)? {
            0 => Field::Bool(bool::decode(reader)?),
            1 => Field::Int(i64::decode(reader)?),
            2 => Field::Real(f64::decode(reader)?),
            3 => Field::Str(String::decode(reader)?),
            4 => Field::Bytes(Bytes::decode(reader)?),
            5 => Field::Id(Ulid::decode(reader)?),
            6 => Field::Desc(Box::new(Field::decode(reader)?)),
            tag => return Err(DecodeError::UnknownTag { what: "field", tag }),
        })
    }
}

/// Ordered tuple of fields.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<Field>);

impl Key {
    /// Key made of `fields`, in order.
    pub fn new(fields: Vec<Field>) -> Self {
        Key(fields)
    }

    /// Fields in order.
    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    /// Number of fields.
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Whether the first fields equal `prefix`.
    pub fn starts_with(&self, prefix: &[Field]) -> bool {
        self.0.starts_with(prefix)
    }

    /// Approximate heap bytes owned by the key.
    pub fn heap_size(&self) -> usize {
        self.0.iter().map(Field::heap_size).sum()
    }
}

impl From<Vec<Field>> for Key {
    fn from(fields: Vec<Field>) -> Self {
        Key(fields)
    }
}

impl FromIterator<Field> for Key {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Key(iter.into_iter().collect())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("");
        for field in &self.0 {
            tuple.field(field);
        }
        tuple.finish()
    }
}

impl Encode for Key {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.0.len() as u16).encode(buf);
        for field in &self.0 {
            field.encode(buf);
        }
    }

    fn size(&self) -> usize {
        2 + self.0.iter().map(Encode::size).sum::<usize>()
    }
}

impl Decode for Key {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = u16::decode(reader)? as usize;
        let mut fields = Vec::with_capacity(len);
        for _ in 0..len {
            fields.push(Field::decode(reader)?);
        }
        Ok(Key(fields))
    }
}

/// Build a [`Key`] from values convertible into [`Field`].
///
/// ```
/// use stratum::{key, key::Field};
///
/// let k = key![1i64, "a", Field::desc(3i64)];
/// assert_eq!(k.arity(), 3);
/// ```
#[macro_export]
macro_rules! key {
    ($($field:expr),* $(,)?) => {
        $crate::key::Key::new(vec![$($crate::key::Field::from($field)),*])
    };
}

/// A key qualified by the index it belongs to. Index ids order first.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    /// Index the key belongs to.
    pub index: IndexId,
    /// Key inside the index.
    pub key: Key,
}

impl IndexKey {
    /// Qualify `key` with `index`.
    pub fn new(index: IndexId, key: Key) -> Self {
        IndexKey { index, key }
    }

    /// Approximate heap bytes owned by the key.
    pub fn heap_size(&self) -> usize {
        16 + self.key.heap_size()
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.index, self.key)
    }
}

impl Encode for IndexKey {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.index.encode(buf);
        self.key.encode(buf);
    }

    fn size(&self) -> usize {
        self.index.size() + self.key.size()
    }
}

impl Decode for IndexKey {
    fn decode(reader: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(IndexKey {
            index: Ulid::decode(reader)?,
            key: Key::decode(reader)?,
        })
    }
}

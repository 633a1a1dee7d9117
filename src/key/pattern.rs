use super::{Field, IndexKey, Key};
use crate::id::IndexId;

/// One position of a [`KeyPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternField {
    /// Must equal this field.
    Exact(Field),
    /// Matches any field.
    Free,
}

impl From<Field> for PatternField {
    fn from(field: Field) -> Self {
        PatternField::Exact(field)
    }
}

impl From<i64> for PatternField {
    fn from(value: i64) -> Self {
        PatternField::Exact(Field::Int(value))
    }
}

impl From<&str> for PatternField {
    fn from(value: &str) -> Self {
        PatternField::Exact(Field::from(value))
    }
}

/// A key shape with wildcards.
///
/// A key matches when it has the same arity and agrees on every exact
/// position. Walkers seek to the exact prefix that precedes the first free
/// position; all matching keys sort at or after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    index: IndexId,
    fields: Vec<PatternField>,
    prefix: Vec<Field>,
}

impl KeyPattern {
    /// Pattern over the keys of `index`; trailing positions not listed are free.
    pub fn new(index: IndexId, fields: Vec<PatternField>) -> Self {
        let prefix = fields
            .iter()
            .map_while(|field| match field {
                PatternField::Exact(f) => Some(f.clone()),
                PatternField::Free => None,
            })
            .collect();
        KeyPattern {
            index,
            fields,
            prefix,
        }
    }

    /// Pattern matching exactly one key.
    pub fn exact(key: &IndexKey) -> Self {
        Self::new(
            key.index,
            key.key
                .fields()
                .iter()
                .cloned()
                .map(PatternField::Exact)
                .collect(),
        )
    }

    /// Index the pattern ranges over.
    pub fn index(&self) -> IndexId {
        self.index
    }

    /// Whether every position is fixed.
    pub fn is_exact(&self) -> bool {
        self.prefix.len() == self.fields.len()
    }

    /// Smallest key a matching key can have.
    pub fn seek_key(&self) -> IndexKey {
        IndexKey::new(self.index, Key::new(self.prefix.clone()))
    }

    /// Whether `key` belongs to the index and agrees on every fixed position.
    pub fn matches(&self, key: &IndexKey) -> bool {
        key.index == self.index
            && key.key.arity() == self.fields.len()
            && self
                .fields
                .iter()
                .zip(key.key.fields())
                .all(|(pattern, field)| match pattern {
                    PatternField::Exact(expected) => expected == field,
                    PatternField::Free => true,
                })
    }

    /// Whether no key at or after `key` can match.
    pub fn is_past(&self, key: &IndexKey) -> bool {
        key.index != self.index || !key.key.starts_with(&self.prefix)
    }
}

/// Inclusive key range `[from, to]` within one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    from: IndexKey,
    to: IndexKey,
}

impl KeyRange {
    /// # Panics
    ///
    /// Panics when the two ends belong to different indexes.
    pub fn new(from: IndexKey, to: IndexKey) -> Self {
        assert_eq!(from.index, to.index, "key range must stay within one index");
        KeyRange { from, to }
    }

    /// Inclusive lower end.
    pub fn start(&self) -> &IndexKey {
        &self.from
    }

    /// Inclusive upper end.
    pub fn end(&self) -> &IndexKey {
        &self.to
    }

    /// Whether `key` lies between both ends, inclusive.
    pub fn contains(&self, key: &IndexKey) -> bool {
        &self.from <= key && key <= &self.to
    }
}

/// What a present walker enumerates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope {
    /// Keys matching a pattern.
    Pattern(KeyPattern),
    /// Keys inside a closed range.
    Range(KeyRange),
}

impl KeyScope {
    /// Key every layer cursor seeks to.
    pub fn seek_key(&self) -> IndexKey {
        match self {
            KeyScope::Pattern(pattern) => pattern.seek_key(),
            KeyScope::Range(range) => range.from.clone(),
        }
    }

    /// Whether the key belongs to the result set.
    pub fn admits(&self, key: &IndexKey) -> bool {
        match self {
            KeyScope::Pattern(pattern) => pattern.matches(key),
            KeyScope::Range(range) => range.contains(key),
        }
    }

    /// Whether iteration in key order can stop at `key`.
    pub fn is_past(&self, key: &IndexKey) -> bool {
        match self {
            KeyScope::Pattern(pattern) => pattern.is_past(key),
            KeyScope::Range(range) => key > &range.to,
        }
    }
}

impl From<KeyPattern> for KeyScope {
    fn from(pattern: KeyPattern) -> Self {
        KeyScope::Pattern(pattern)
    }
}

impl From<KeyRange> for KeyScope {
    fn from(range: KeyRange) -> Self {
        KeyScope::Range(range)
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::key;

    fn index() -> IndexId {
        Ulid::from_parts(1, 1)
    }

    #[test]
    fn pattern_seeks_exact_prefix() {
        let pattern = KeyPattern::new(
            index(),
            vec![1i64.into(), PatternField::Free, "x".into()],
        );
        assert!(!pattern.is_exact());
        assert_eq!(pattern.seek_key(), IndexKey::new(index(), key![1i64]));

        assert!(pattern.matches(&IndexKey::new(index(), key![1i64, 9i64, "x"])));
        assert!(!pattern.matches(&IndexKey::new(index(), key![1i64, 9i64, "y"])));
        assert!(!pattern.matches(&IndexKey::new(index(), key![1i64, 9i64])));
        assert!(!pattern.is_past(&IndexKey::new(index(), key![1i64, 9i64, "y"])));
        assert!(pattern.is_past(&IndexKey::new(index(), key![2i64])));
        assert!(pattern.is_past(&IndexKey::new(Ulid::from_parts(2, 0), key![1i64])));
    }

    #[test]
    fn exact_pattern() {
        let key = IndexKey::new(index(), key![3i64]);
        let pattern = KeyPattern::exact(&key);
        assert!(pattern.is_exact());
        assert!(pattern.matches(&key));
        assert_eq!(pattern.seek_key(), key);
    }

    #[test]
    fn range_is_inclusive() {
        let range = KeyRange::new(
            IndexKey::new(index(), key![1i64]),
            IndexKey::new(index(), key![3i64]),
        );
        let scope = KeyScope::from(range);
        assert!(scope.admits(&IndexKey::new(index(), key![1i64])));
        assert!(scope.admits(&IndexKey::new(index(), key![3i64])));
        assert!(!scope.is_past(&IndexKey::new(index(), key![3i64])));
        assert!(scope.is_past(&IndexKey::new(index(), key![3i64, 0i64])));
    }

    #[test]
    #[should_panic(expected = "one index")]
    fn range_across_indexes() {
        let _ = KeyRange::new(
            IndexKey::new(Ulid::from_parts(1, 0), key![1i64]),
            IndexKey::new(Ulid::from_parts(2, 0), key![1i64]),
        );
    }
}

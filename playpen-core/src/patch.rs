//! Byte-range text patches.
//!
//! Offsets are UTF-8 byte offsets into the buffer text and must land on
//! character boundaries. A patch deletes `delete` bytes at `index` and then
//! inserts `insert` at the same position.

use serde::{Deserialize, Serialize};

use crate::replica::ReplicaError;

/// A single replaced range in a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPatch {
    pub index: u32,
    pub delete: u32,
    pub insert: String,
}

impl TextPatch {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            delete: 0,
            insert: text.into(),
        }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        Self {
            index,
            delete: len,
            insert: String::new(),
        }
    }

    pub fn replace(index: u32, len: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            delete: len,
            insert: text.into(),
        }
    }

    /// Smallest single-range patch turning `old` into `new`.
    ///
    /// Editors that only report the whole buffer value go through here.
    /// Returns `None` when the texts are equal.
    pub fn diff(old: &str, new: &str) -> Option<Self> {
        if old == new {
            return None;
        }

        let prefix: usize = old
            .chars()
            .zip(new.chars())
            .take_while(|(a, b)| a == b)
            .map(|(c, _)| c.len_utf8())
            .sum();

        let old_rest = &old[prefix..];
        let new_rest = &new[prefix..];
        let suffix: usize = old_rest
            .chars()
            .rev()
            .zip(new_rest.chars().rev())
            .take_while(|(a, b)| a == b)
            .map(|(c, _)| c.len_utf8())
            .sum();

        Some(Self {
            index: prefix as u32,
            delete: (old_rest.len() - suffix) as u32,
            insert: new_rest[..new_rest.len() - suffix].to_string(),
        })
    }

    /// Whether the patch removes nothing and inserts nothing.
    pub fn is_noop(&self) -> bool {
        self.delete == 0 && self.insert.is_empty()
    }

    /// Check the patch against the text it is about to be applied to.
    pub fn validate(&self, text: &str) -> Result<(), ReplicaError> {
        let start = self.index as usize;
        let end = start + self.delete as usize;
        if end > text.len() {
            return Err(ReplicaError::InvalidPatch(format!(
                "range {start}..{end} exceeds buffer length {}",
                text.len()
            )));
        }
        if !text.is_char_boundary(start) || !text.is_char_boundary(end) {
            return Err(ReplicaError::InvalidPatch(format!(
                "range {start}..{end} splits a character"
            )));
        }
        Ok(())
    }

    /// Apply to a plain string.
    pub fn apply_to(&self, text: &str) -> Result<String, ReplicaError> {
        self.validate(text)?;
        let start = self.index as usize;
        let end = start + self.delete as usize;
        let mut out = String::with_capacity(text.len() - self.delete as usize + self.insert.len());
        out.push_str(&text[..start]);
        out.push_str(&self.insert);
        out.push_str(&text[end..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_equal_is_none() {
        assert!(TextPatch::diff("abc", "abc").is_none());
    }

    #[test]
    fn test_diff_middle_insert() {
        let patch = TextPatch::diff("hello world", "hello brave world").unwrap();
        assert_eq!(patch, TextPatch::insert(6, "brave "));
    }

    #[test]
    fn test_diff_replace_tail() {
        let patch = TextPatch::diff("color: red;", "color: blue;").unwrap();
        assert_eq!(patch.apply_to("color: red;").unwrap(), "color: blue;");
        assert_eq!(patch.index, 7);
    }

    #[test]
    fn test_diff_repeated_characters() {
        // prefix and suffix must not overlap
        let patch = TextPatch::diff("aaa", "aaaa").unwrap();
        assert_eq!(patch.apply_to("aaa").unwrap(), "aaaa");
        assert_eq!(patch.delete, 0);
    }

    #[test]
    fn test_diff_multibyte_boundaries() {
        let old = "héllo";
        let new = "hèllo";
        let patch = TextPatch::diff(old, new).unwrap();
        assert_eq!(patch.index, 1);
        assert_eq!(patch.delete, 2);
        assert_eq!(patch.apply_to(old).unwrap(), new);
    }

    #[test]
    fn test_validate_out_of_range() {
        let err = TextPatch::delete(2, 10).validate("abc").unwrap_err();
        assert!(matches!(err, ReplicaError::InvalidPatch(_)));
    }

    #[test]
    fn test_validate_char_boundary() {
        // 'é' occupies bytes 1..3
        assert!(TextPatch::insert(2, "x").validate("héllo").is_err());
        assert!(TextPatch::insert(3, "x").validate("héllo").is_ok());
    }

    #[test]
    fn test_is_noop() {
        assert!(TextPatch::insert(0, "").is_noop());
        assert!(!TextPatch::delete(0, 1).is_noop());
    }
}

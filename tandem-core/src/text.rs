//! Char-indexed document text.

use ropey::Rope;
use std::fmt;

use crate::error::DocumentError;
use crate::operation::Edit;

/// Document text backed by a rope, addressed in chars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentText {
    rope: Rope,
}

impl DocumentText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.rope.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.rope.len_chars() == 0
    }

    /// Apply an edit, or leave the text untouched if it does not fit.
    pub fn apply(&mut self, edit: &Edit) -> Result<(), DocumentError> {
        let len = self.len();
        if !edit.fits(len) {
            return Err(DocumentError::OutOfBounds {
                edit: edit.clone(),
                len,
            });
        }

        match edit {
            Edit::Insert { position, text } => self.rope.insert(*position, text),
            Edit::Delete { position, len } => self.rope.remove(*position..*position + *len),
            Edit::Retain => {}
        }
        Ok(())
    }
}

impl From<&str> for DocumentText {
    fn from(text: &str) -> Self {
        Self {
            rope: Rope::from_str(text),
        }
    }
}

impl fmt::Display for DocumentText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.rope.chunks() {
            f.write_str(chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_delete() {
        let mut text = DocumentText::from("hello");
        text.apply(&Edit::insert(5, " world")).unwrap();
        assert_eq!(text.to_string(), "hello world");
        text.apply(&Edit::delete(0, 6)).unwrap();
        assert_eq!(text.to_string(), "world");
    }

    #[test]
    fn test_positions_are_chars_not_bytes() {
        let mut text = DocumentText::from("naïve");
        text.apply(&Edit::delete(2, 1)).unwrap();
        assert_eq!(text.to_string(), "nave");
        assert_eq!(text.len(), 4);
    }

    #[test]
    fn test_out_of_bounds_leaves_text_unchanged() {
        let mut text = DocumentText::from("abc");
        assert!(text.apply(&Edit::delete(2, 5)).is_err());
        assert!(text.apply(&Edit::insert(9, "x")).is_err());
        assert_eq!(text.to_string(), "abc");
    }

    #[test]
    fn test_noops() {
        let mut text = DocumentText::from("abc");
        text.apply(&Edit::Retain).unwrap();
        text.apply(&Edit::delete(3, 0)).unwrap();
        assert_eq!(text.to_string(), "abc");
    }
}

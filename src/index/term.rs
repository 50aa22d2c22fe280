//! Terms: a field name plus the indexed text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A term, the unit of deletion and lookup.
///
/// Terms order by field first and then by text, which is the order the
/// delete stream seeks them in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    /// The field name.
    pub field: String,

    /// The term text.
    pub text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    /// Approximate heap bytes held by this term.
    pub fn bytes_used(&self) -> usize {
        self.field.len() + self.text.len() + 2 * std::mem::size_of::<String>()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        let mut terms = vec![
            Term::new("title", "a"),
            Term::new("body", "zebra"),
            Term::new("body", "apple"),
        ];
        terms.sort();

        assert_eq!(terms[0], Term::new("body", "apple"));
        assert_eq!(terms[1], Term::new("body", "zebra"));
        assert_eq!(terms[2], Term::new("title", "a"));
    }

    #[test]
    fn test_term_display() {
        assert_eq!(Term::new("id", "42").to_string(), "id:42");
    }
}

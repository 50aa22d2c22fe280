//! Field and field value types.

use serde::{Deserialize, Serialize};

/// The value carried by a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Analyzed full text.
    Text(String),

    /// Un-analyzed single term, e.g. a primary key.
    Keyword(String),

    /// Numeric doc value.
    Numeric(i64),

    /// Binary doc value.
    Binary(Vec<u8>),
}

impl FieldValue {
    /// Get the text content of a text or keyword value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Keyword(s) => Some(s),
            _ => None,
        }
    }

    /// Get the numeric content.
    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            FieldValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the binary content.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Whether the value produces postings.
    pub fn is_indexed(&self) -> bool {
        matches!(self, FieldValue::Text(_) | FieldValue::Keyword(_))
    }

    /// Whether the value is a doc value.
    pub fn is_doc_value(&self) -> bool {
        matches!(self, FieldValue::Numeric(_) | FieldValue::Binary(_))
    }
}

/// A named value plus its storage option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// The field name.
    pub name: String,

    /// The field value.
    pub value: FieldValue,

    /// Whether the original value is kept in stored fields.
    pub stored: bool,
}

impl Field {
    /// Create a new field.
    pub fn new<S: Into<String>>(name: S, value: FieldValue, stored: bool) -> Self {
        Field {
            name: name.into(),
            value,
            stored,
        }
    }

    /// A stored, analyzed text field.
    pub fn text<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Field::new(name, FieldValue::Text(value.into()), true)
    }

    /// A stored keyword field.
    pub fn keyword<S: Into<String>, T: Into<String>>(name: S, value: T) -> Self {
        Field::new(name, FieldValue::Keyword(value.into()), true)
    }

    /// A numeric doc-values field (not stored).
    pub fn numeric<S: Into<String>>(name: S, value: i64) -> Self {
        Field::new(name, FieldValue::Numeric(value), false)
    }

    /// A binary doc-values field (not stored).
    pub fn binary<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Field::new(name, FieldValue::Binary(value), false)
    }

    /// Change the stored flag.
    pub fn with_stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_accessors() {
        assert_eq!(FieldValue::Text("a b".into()).as_text(), Some("a b"));
        assert_eq!(FieldValue::Keyword("id-1".into()).as_text(), Some("id-1"));
        assert_eq!(FieldValue::Numeric(7).as_numeric(), Some(7));
        assert_eq!(FieldValue::Binary(vec![1]).as_binary(), Some(&[1u8][..]));
        assert!(FieldValue::Numeric(1).is_doc_value());
        assert!(!FieldValue::Numeric(1).is_indexed());
    }

    #[test]
    fn test_field_constructors() {
        let field = Field::text("body", "hello");
        assert!(field.stored);
        let field = Field::numeric("price", 10).with_stored(true);
        assert!(field.stored);
        assert_eq!(field.value, FieldValue::Numeric(10));
    }
}

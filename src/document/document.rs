//! Document structure.

use serde::{Deserialize, Serialize};

use crate::document::field::{Field, FieldValue};

/// A document is an ordered list of fields. Field names may repeat for
/// text and keyword fields; doc-values fields must appear at most once.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Document { fields: Vec::new() }
    }

    /// Append a field.
    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// Get the first value of a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Check if the document has a field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        DocumentBuilder {
            document: Document::new(),
        }
    }

    /// Add a stored text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add(Field::text(name, value));
        self
    }

    /// Add a stored keyword field.
    pub fn add_keyword<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add(Field::keyword(name, value));
        self
    }

    /// Add a numeric doc-values field.
    pub fn add_numeric<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add(Field::numeric(name, value));
        self
    }

    /// Add a binary doc-values field.
    pub fn add_binary<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add(Field::binary(name, value));
        self
    }

    /// Add an arbitrary field.
    pub fn add_field(mut self, field: Field) -> Self {
        self.document.add(field);
        self
    }

    /// Build the final document.
    pub fn build(self) -> Document {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_builder() {
        let doc = Document::builder()
            .add_keyword("id", "1")
            .add_text("body", "first")
            .add_text("body", "second")
            .add_numeric("rank", 5)
            .build();

        assert_eq!(doc.len(), 4);
        assert_eq!(doc.get("body"), Some(&FieldValue::Text("first".into())));
        assert_eq!(doc.get("rank").and_then(|v| v.as_numeric()), Some(5));
        assert!(!doc.has_field("missing"));
    }
}

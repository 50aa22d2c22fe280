//! Per-segment field metadata and the index-wide field number registry.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::document::field::FieldValue;
use crate::error::{Result, StrataError};

/// Kind of doc values a field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocValuesType {
    /// One `i64` per document.
    Numeric,
    /// One byte string per document.
    Binary,
}

impl DocValuesType {
    /// The doc-values type a field value implies, if any.
    pub fn of(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Numeric(_) => Some(DocValuesType::Numeric),
            FieldValue::Binary(_) => Some(DocValuesType::Binary),
            _ => None,
        }
    }
}

/// Metadata of one field within one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Index-wide field number.
    pub number: u32,
    /// Whether the field has postings.
    pub indexed: bool,
    /// Whether norms are recorded (analyzed text fields only).
    pub has_norms: bool,
    /// Whether some document stored a value for the field.
    pub stored: bool,
    /// Doc-values type, if the field carries doc values.
    pub doc_values: Option<DocValuesType>,
}

/// The field metadata of one segment, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfos {
    by_name: BTreeMap<String, FieldInfo>,
}

impl FieldInfos {
    /// Look up a field.
    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name)
    }

    /// Iterate over all fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.by_name.values()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Whether any field carries doc values.
    pub fn has_doc_values(&self) -> bool {
        self.by_name.values().any(|f| f.doc_values.is_some())
    }

    /// The doc-values type of a field, if any.
    pub fn doc_values_type(&self, name: &str) -> Option<DocValuesType> {
        self.by_name.get(name).and_then(|f| f.doc_values)
    }
}

/// Accumulates field metadata while a segment is being built.
#[derive(Debug, Default)]
pub struct FieldInfosBuilder {
    by_name: BTreeMap<String, FieldInfo>,
}

impl FieldInfosBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the builder with existing infos, e.g. the inputs of a merge.
    pub fn add_all(&mut self, global: &FieldNumbers, infos: &FieldInfos) -> Result<()> {
        for info in infos.iter() {
            let number = global.add_or_get(&info.name, info.doc_values)?;
            let entry = self
                .by_name
                .entry(info.name.clone())
                .or_insert_with(|| FieldInfo {
                    name: info.name.clone(),
                    number,
                    indexed: false,
                    has_norms: false,
                    stored: false,
                    doc_values: None,
                });
            entry.indexed |= info.indexed;
            entry.has_norms |= info.has_norms;
            entry.stored |= info.stored;
            if entry.doc_values.is_none() {
                entry.doc_values = info.doc_values;
            }
        }
        Ok(())
    }

    /// Register a field occurrence, checking doc-values consistency against
    /// the index-wide registry.
    pub fn add_or_update(
        &mut self,
        global: &FieldNumbers,
        name: &str,
        value: &FieldValue,
        stored: bool,
    ) -> Result<&FieldInfo> {
        let dv_type = DocValuesType::of(value);
        if let Some(existing) = self.by_name.get(name) {
            if let (Some(have), Some(want)) = (existing.doc_values, dv_type) {
                if have != want {
                    return Err(StrataError::document(format!(
                        "cannot change doc values type from {have:?} to {want:?} for field \"{name}\""
                    )));
                }
            }
        }
        let number = global.add_or_get(name, dv_type)?;

        let entry = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| FieldInfo {
                name: name.to_string(),
                number,
                indexed: false,
                has_norms: false,
                stored: false,
                doc_values: None,
            });
        entry.indexed |= value.is_indexed();
        entry.has_norms |= matches!(value, FieldValue::Text(_));
        entry.stored |= stored;
        if entry.doc_values.is_none() {
            entry.doc_values = dv_type;
        }
        Ok(entry)
    }

    /// Look up a field registered so far.
    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name)
    }

    /// Freeze into [`FieldInfos`]; the builder is left empty.
    pub fn finish(&mut self) -> FieldInfos {
        FieldInfos {
            by_name: std::mem::take(&mut self.by_name),
        }
    }

    /// Drop everything registered so far.
    pub fn clear(&mut self) {
        self.by_name.clear();
    }
}

#[derive(Debug, Default)]
struct FieldNumbersInner {
    numbers: HashMap<String, u32>,
    doc_values: HashMap<String, DocValuesType>,
    next: u32,
}

/// Index-wide map from field name to number and doc-values type.
///
/// Shared by every per-thread buffer so the same field gets the same
/// number and doc-values type in every segment.
#[derive(Debug, Default)]
pub struct FieldNumbers {
    inner: Mutex<FieldNumbersInner>,
}

impl FieldNumbers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the number of a field, registering it if new.
    ///
    /// Fails if the field was registered with a different doc-values type.
    pub fn add_or_get(&self, name: &str, doc_values: Option<DocValuesType>) -> Result<u32> {
        let mut inner = self.inner.lock();
        if let Some(want) = doc_values {
            match inner.doc_values.get(name) {
                Some(&have) if have != want => {
                    return Err(StrataError::document(format!(
                        "cannot change doc values type from {have:?} to {want:?} for field \"{name}\""
                    )));
                }
                Some(_) => {}
                None => {
                    inner.doc_values.insert(name.to_string(), want);
                }
            }
        }
        if let Some(&number) = inner.numbers.get(name) {
            return Ok(number);
        }
        let number = inner.next;
        inner.next += 1;
        inner.numbers.insert(name.to_string(), number);
        Ok(number)
    }

    /// Whether a field exists with exactly this doc-values type.
    pub fn contains(&self, name: &str, doc_values: DocValuesType) -> bool {
        self.inner.lock().doc_values.get(name) == Some(&doc_values)
    }

    /// Forget all fields.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.numbers.clear();
        inner.doc_values.clear();
        inner.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_numbers_are_stable() {
        let numbers = FieldNumbers::new();
        assert_eq!(numbers.add_or_get("title", None).unwrap(), 0);
        assert_eq!(numbers.add_or_get("body", None).unwrap(), 1);
        assert_eq!(numbers.add_or_get("title", None).unwrap(), 0);
    }

    #[test]
    fn test_doc_values_type_conflict() {
        let numbers = FieldNumbers::new();
        numbers
            .add_or_get("price", Some(DocValuesType::Numeric))
            .unwrap();
        let err = numbers
            .add_or_get("price", Some(DocValuesType::Binary))
            .unwrap_err();
        assert!(!err.is_aborting());
        assert!(numbers.contains("price", DocValuesType::Numeric));
        assert!(!numbers.contains("price", DocValuesType::Binary));
    }

    #[test]
    fn test_builder_merges_flags() {
        let numbers = FieldNumbers::new();
        let mut builder = FieldInfosBuilder::new();
        builder
            .add_or_update(&numbers, "body", &FieldValue::Text("x".into()), false)
            .unwrap();
        builder
            .add_or_update(&numbers, "body", &FieldValue::Text("y".into()), true)
            .unwrap();
        builder
            .add_or_update(&numbers, "price", &FieldValue::Numeric(3), false)
            .unwrap();

        let infos = builder.finish();
        let body = infos.get("body").unwrap();
        assert!(body.indexed && body.has_norms && body.stored);
        assert_eq!(infos.doc_values_type("price"), Some(DocValuesType::Numeric));
        assert!(infos.has_doc_values());
        assert!(builder.get("body").is_none());
    }
}

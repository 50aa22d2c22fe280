//! Document model for indexing.
//!
//! A [`Document`] is an ordered list of named [`Field`]s. The field value
//! decides how the indexing chain consumes it:
//!
//! - **Text**: analyzed into postings with positions and a length norm
//! - **Keyword**: indexed verbatim as a single term
//! - **Numeric**: a numeric doc value, updatable in place
//! - **Binary**: a binary doc value, updatable in place
//!
//! Any field may additionally be stored.
//!
//! # Examples
//!
//! ```
//! use strata::document::Document;
//!
//! let doc = Document::builder()
//!     .add_keyword("id", "doc-1")
//!     .add_text("body", "Rust segment merging")
//!     .add_numeric("version", 3)
//!     .build();
//!
//! assert_eq!(doc.len(), 3);
//! assert!(doc.has_field("body"));
//! ```

#[allow(clippy::module_inception)]
pub mod document;
pub mod field;

pub use document::{Document, DocumentBuilder};
pub use field::{Field, FieldValue};

//! Text analysis for strata.
//!
//! Analyzers turn a raw field value into a stream of [`Token`]s that the
//! indexing chain inverts into postings. The pipeline is intentionally small:
//! a [`Tokenizer`] followed by zero or more [`Filter`]s, wrapped by an
//! [`Analyzer`].

pub mod analyzer;
pub mod token;
pub mod token_filter;
pub mod tokenizer;

pub use analyzer::Analyzer;
pub use token::{Token, TokenStream};
pub use token_filter::Filter;
pub use tokenizer::Tokenizer;

//! Analyzers combine a tokenizer with token filters.
//!
//! # Examples
//!
//! ```
//! use strata::analysis::analyzer::Analyzer;
//! use strata::analysis::analyzer::standard::StandardAnalyzer;
//!
//! let analyzer = StandardAnalyzer::new();
//! let tokens: Vec<_> = analyzer.analyze("Hello World").unwrap().collect();
//!
//! assert_eq!(tokens[0].text, "hello");
//! assert_eq!(tokens[1].text, "world");
//! ```

use crate::analysis::token::TokenStream;
use crate::error::Result;

pub mod keyword;
pub mod pipeline;
pub mod standard;

pub use keyword::KeywordAnalyzer;
pub use pipeline::PipelineAnalyzer;
pub use standard::StandardAnalyzer;

/// Trait for analyzers that convert field text into tokens.
///
/// Analyzers are shared by every indexing thread, hence `Send + Sync`.
/// An error returned from [`analyze`](Self::analyze) fails only the
/// document being indexed unless it is [`StrataError::Aborting`].
///
/// [`StrataError::Aborting`]: crate::error::StrataError::Aborting
pub trait Analyzer: Send + Sync {
    /// Analyze the given text and return a stream of tokens.
    fn analyze(&self, text: &str) -> Result<TokenStream>;

    /// Get the name of this analyzer (for debugging and configuration).
    fn name(&self) -> &'static str;
}

//! Pipeline analyzer that combines a tokenizer and filters.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use strata::analysis::analyzer::Analyzer;
//! use strata::analysis::analyzer::pipeline::PipelineAnalyzer;
//! use strata::analysis::token_filter::lowercase::LowercaseFilter;
//! use strata::analysis::tokenizer::whitespace::WhitespaceTokenizer;
//!
//! let analyzer = PipelineAnalyzer::new(Arc::new(WhitespaceTokenizer::new()))
//!     .add_filter(Arc::new(LowercaseFilter::new()))
//!     .with_name("lower_whitespace");
//!
//! let tokens: Vec<_> = analyzer.analyze("Foo-Bar BAZ").unwrap().collect();
//! assert_eq!(tokens[0].text, "foo-bar");
//! assert_eq!(tokens[1].text, "baz");
//! ```

use std::sync::Arc;

use crate::analysis::analyzer::Analyzer;
use crate::analysis::token::TokenStream;
use crate::analysis::token_filter::Filter;
use crate::analysis::tokenizer::Tokenizer;
use crate::error::Result;

/// A configurable analyzer: one tokenizer followed by filters in order.
#[derive(Clone)]
pub struct PipelineAnalyzer {
    tokenizer: Arc<dyn Tokenizer>,
    filters: Vec<Arc<dyn Filter>>,
    name: &'static str,
}

impl PipelineAnalyzer {
    /// Create a new pipeline analyzer with the given tokenizer.
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        PipelineAnalyzer {
            tokenizer,
            filters: Vec::new(),
            name: "pipeline",
        }
    }

    /// Add a filter to the end of the pipeline.
    pub fn add_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Set the analyzer name.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// The tokenizer used by this pipeline.
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// The filters applied by this pipeline.
    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }
}

impl Analyzer for PipelineAnalyzer {
    fn analyze(&self, text: &str) -> Result<TokenStream> {
        let mut tokens = self.tokenizer.tokenize(text)?;
        for filter in &self.filters {
            tokens = filter.filter(tokens)?;
        }
        Ok(tokens)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for PipelineAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineAnalyzer")
            .field("tokenizer", &self.tokenizer.name())
            .field(
                "filters",
                &self.filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .field("name", &self.name)
            .finish()
    }
}

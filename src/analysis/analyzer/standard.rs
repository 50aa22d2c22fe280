//! Standard analyzer: Unicode word boundaries plus lowercasing.

use std::sync::Arc;

use crate::analysis::analyzer::Analyzer;
use crate::analysis::analyzer::pipeline::PipelineAnalyzer;
use crate::analysis::token::TokenStream;
use crate::analysis::token_filter::lowercase::LowercaseFilter;
use crate::analysis::tokenizer::unicode_word::UnicodeWordTokenizer;
use crate::error::Result;

/// The default analyzer for text fields.
#[derive(Clone, Debug)]
pub struct StandardAnalyzer {
    inner: PipelineAnalyzer,
}

impl StandardAnalyzer {
    /// Create a new standard analyzer.
    pub fn new() -> Self {
        let inner = PipelineAnalyzer::new(Arc::new(UnicodeWordTokenizer::new()))
            .add_filter(Arc::new(LowercaseFilter::new()))
            .with_name("standard");
        StandardAnalyzer { inner }
    }

    /// Get the inner pipeline analyzer.
    pub fn inner(&self) -> &PipelineAnalyzer {
        &self.inner
    }
}

impl Default for StandardAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for StandardAnalyzer {
    fn analyze(&self, text: &str) -> Result<TokenStream> {
        self.inner.analyze(text)
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

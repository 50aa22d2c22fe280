//! Keyword analyzer that emits the whole input as one token.

use crate::analysis::analyzer::Analyzer;
use crate::analysis::token::{Token, TokenStream};
use crate::error::Result;

/// An analyzer for identifiers: the entire input becomes a single token.
#[derive(Clone, Debug, Default)]
pub struct KeywordAnalyzer;

impl KeywordAnalyzer {
    /// Create a new keyword analyzer.
    pub fn new() -> Self {
        KeywordAnalyzer
    }
}

impl Analyzer for KeywordAnalyzer {
    fn analyze(&self, text: &str) -> Result<TokenStream> {
        if text.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(std::iter::once(Token::new(text, 0))))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_analyzer() {
        let analyzer = KeywordAnalyzer::new();

        let tokens: Vec<Token> = analyzer.analyze("Hello World Test").unwrap().collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].text, "Hello World Test");

        assert_eq!(analyzer.analyze("").unwrap().count(), 0);
    }
}

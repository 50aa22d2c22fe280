//! Lowercase filter implementation.

use crate::analysis::token::TokenStream;
use crate::analysis::token_filter::Filter;
use crate::error::Result;

/// A filter that converts token text to lowercase.
#[derive(Clone, Debug, Default)]
pub struct LowercaseFilter;

impl LowercaseFilter {
    /// Create a new lowercase filter.
    pub fn new() -> Self {
        LowercaseFilter
    }
}

impl Filter for LowercaseFilter {
    fn filter(&self, tokens: TokenStream) -> Result<TokenStream> {
        Ok(Box::new(tokens.map(|token| {
            if token.text.chars().any(char::is_uppercase) {
                let lowered = token.text.to_lowercase();
                token.with_text(lowered)
            } else {
                token
            }
        })))
    }

    fn name(&self) -> &'static str {
        "lowercase"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::token::Token;

    #[test]
    fn test_lowercase_filter() {
        let filter = LowercaseFilter::new();
        let tokens = vec![Token::new("Hello", 0), Token::new("WORLD", 1)];

        let result: Vec<Token> = filter.filter(Box::new(tokens.into_iter())).unwrap().collect();

        assert_eq!(result[0].text, "hello");
        assert_eq!(result[1].text, "world");
        assert_eq!(result[1].position, 1);
    }
}

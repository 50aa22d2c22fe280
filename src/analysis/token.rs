//! Token types produced by analysis.
//!
//! # Examples
//!
//! ```
//! use strata::analysis::token::Token;
//!
//! let token = Token::with_offsets("world", 1, 6, 11);
//! assert_eq!(token.text, "world");
//! assert_eq!(token.position_increment, 1);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single analyzed token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// The text content of the token.
    pub text: String,

    /// The position of the token in the original token stream (0-based).
    pub position: usize,

    /// Byte offset where this token starts in the original text.
    pub start_offset: usize,

    /// Byte offset where this token ends in the original text.
    pub end_offset: usize,

    /// Position increment from the previous token (default: 1).
    ///
    /// 0 stacks the token on the previous position; values above 1 leave
    /// holes, e.g. where stop words were removed.
    pub position_increment: usize,
}

impl Token {
    /// Create a new token with the given text and position.
    pub fn new<S: Into<String>>(text: S, position: usize) -> Self {
        let text = text.into();
        let end_offset = text.len();
        Token {
            text,
            position,
            start_offset: 0,
            end_offset,
            position_increment: 1,
        }
    }

    /// Create a new token with explicit byte offsets.
    pub fn with_offsets<S: Into<String>>(
        text: S,
        position: usize,
        start_offset: usize,
        end_offset: usize,
    ) -> Self {
        Token {
            text: text.into(),
            position,
            start_offset,
            end_offset,
            position_increment: 1,
        }
    }

    /// Replace the token text, keeping position and offsets.
    pub fn with_text<S: Into<String>>(mut self, text: S) -> Self {
        self.text = text.into();
        self
    }

    /// Set the position increment.
    pub fn with_position_increment(mut self, increment: usize) -> Self {
        self.position_increment = increment;
        self
    }

    /// Length of the token text in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether the token text is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.text, self.position)
    }
}

/// A stream of tokens.
pub type TokenStream = Box<dyn Iterator<Item = Token> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_creation() {
        let token = Token::new("hello", 0);
        assert_eq!(token.text, "hello");
        assert_eq!(token.end_offset, 5);
        assert_eq!(token.position_increment, 1);
        assert_eq!(token.to_string(), "hello@0");
    }

    #[test]
    fn test_token_builders() {
        let token = Token::with_offsets("Hello", 2, 10, 15)
            .with_text("hello")
            .with_position_increment(0);
        assert_eq!(token.text, "hello");
        assert_eq!(token.start_offset, 10);
        assert_eq!(token.position_increment, 0);
        assert_eq!(token.len(), 5);
    }
}

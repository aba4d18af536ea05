//! # Pattern
//!
//! Byte patterns in the usual "AoB" text form, e.g. `7E ?? 48 8D 15 ?? ?? ?? ??`

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

/// Errors when compiling a textual pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// Pattern text contained no tokens
    #[error("pattern is empty")]
    Empty,
    /// Token has an odd number of hex digits
    #[error("odd-length byte token `{token}`")]
    OddLength {
        /// Offending token
        token: String,
    },
    /// Token is not a two-digit hex byte or a wildcard
    #[error("invalid byte token `{token}`")]
    InvalidHex {
        /// Offending token
        token: String,
    },
}

/// Single position of a [`BytePattern`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Matcher {
    /// Byte must equal this value
    Exact(u8),
    /// Any byte matches
    Any,
}
impl Matcher {
    /// Checks `byte` against this matcher
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            Self::Exact(b) => b == byte,
            Self::Any => true,
        }
    }
}

/// Compiled byte pattern. Immutable once built; never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BytePattern {
    /// Matchers in pattern order
    matchers: Vec<Matcher>,
}
impl BytePattern {
    /// Compiles whitespace-separated tokens into a pattern.
    ///
    /// Each token is either two hex digits or a wildcard (`?` / `??`).
    pub fn compile(text: &str) -> Result<Self, PatternError> {
        let matchers = text
            .split_whitespace()
            .map(parse_token)
            .collect::<Result<Vec<_>, _>>()?;

        if matchers.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self { matchers })
    }

    /// Matchers in pattern order
    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    /// Number of bytes the pattern spans
    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    /// Always false, compilation rejects empty patterns
    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Checks whether `bytes` starts with this pattern
    pub fn matches_at(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.matchers.len()
            && self
                .matchers
                .iter()
                .zip(bytes)
                .all(|(m, b)| m.matches(*b))
    }
}

/// Parses one pattern token
fn parse_token(token: &str) -> Result<Matcher, PatternError> {
    if token == "?" || token == "??" {
        return Ok(Matcher::Any);
    }
    if !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PatternError::InvalidHex {
            token: token.to_owned(),
        });
    }
    if token.len() % 2 != 0 {
        return Err(PatternError::OddLength {
            token: token.to_owned(),
        });
    }
    // four or more digits would silently span several bytes
    if token.len() != 2 {
        return Err(PatternError::InvalidHex {
            token: token.to_owned(),
        });
    }
    u8::from_str_radix(token, 16)
        .map(Matcher::Exact)
        .map_err(|_| PatternError::InvalidHex {
            token: token.to_owned(),
        })
}

impl FromStr for BytePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl Display for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.matchers.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            match m {
                Matcher::Exact(b) => write!(f, "{:02X}", b)?,
                Matcher::Any => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

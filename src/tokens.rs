//! Token pool and round-robin rotation.

use serde::Serialize;

use crate::error::{BulkCheckError, Result};

/// Validated, deduplicated webhook tokens. Never empty.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct TokenPool {
    tokens: Vec<String>,
}

impl TokenPool {
    /// Build a pool, dropping blanks and duplicates while keeping order.
    pub fn new<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = crate::validate::dedup_identifiers(tokens);
        if tokens.is_empty() {
            return Err(BulkCheckError::EmptyTokenPool);
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tokens
    }

    /// Token assigned to batch `batch_index`.
    pub fn for_batch(&self, batch_index: usize) -> &str {
        &self.tokens[batch_index % self.tokens.len()]
    }
}

// Tokens are credentials; keep them out of logs.
impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("len", &self.tokens.len())
            .finish()
    }
}

/// `pool[batch_index mod pool.len()]`, or an error for an empty pool.
pub fn token_for_batch(pool: &[String], batch_index: usize) -> Result<&str> {
    if pool.is_empty() {
        return Err(BulkCheckError::EmptyTokenPool);
    }
    Ok(&pool[batch_index % pool.len()])
}

/// Split `#`-delimited token input into unique, trimmed tokens.
pub fn parse_token_input(input: &str) -> Vec<String> {
    crate::validate::dedup_identifiers(input.split('#'))
}

/// Mask a token for display: first three characters then `xxx`.
pub fn mask_token(token: &str) -> String {
    let head: String = token.chars().take(3).collect();
    format!("{head}xxx")
}

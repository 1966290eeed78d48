use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::driver::Value;

/// Cache keys for query results.
///
/// The key covers the normalized query text, the positional parameters and
/// the execution options, each serialized as JSON. Options that serialize in a
/// different field order produce a different key.
pub struct QueryFingerprint;

impl QueryFingerprint {
    /// Hex-encoded SHA-256 over the normalized query, parameters and options
    pub fn generate<O: Serialize + ?Sized>(query: &str, params: &[Value], options: &O) -> String {
        Self::generate_normalized(&Self::normalize(query), params, options)
    }

    /// Same as [`QueryFingerprint::generate`] for a query that is already normalized
    pub fn generate_normalized<O: Serialize + ?Sized>(
        normalized: &str,
        params: &[Value],
        options: &O,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0]);
        hasher.update(serde_json::to_vec(params).unwrap_or_default());
        hasher.update([0]);
        hasher.update(serde_json::to_vec(options).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    /// Collapse whitespace runs and upper-case everything outside string
    /// literals and quoted identifiers
    pub fn normalize(query: &str) -> String {
        let mut result = String::with_capacity(query.len());
        let mut quote: Option<char> = None;
        let mut after_whitespace = false;

        for ch in query.trim().chars() {
            match quote {
                Some(q) => {
                    result.push(ch);
                    if ch == q {
                        quote = None;
                    }
                }
                None => match ch {
                    '\'' | '"' => {
                        quote = Some(ch);
                        result.push(ch);
                        after_whitespace = false;
                    }
                    c if c.is_whitespace() => {
                        if !after_whitespace {
                            result.push(' ');
                            after_whitespace = true;
                        }
                    }
                    _ => {
                        result.push(ch.to_ascii_uppercase());
                        after_whitespace = false;
                    }
                },
            }
        }

        result
    }
}

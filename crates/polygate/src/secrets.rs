//! Credential masking for log and error output.
//!
//! Known secrets are collected in an append-only registry behind a
//! read-biased lock; readers take a snapshot. Pattern-based masking catches
//! bearer tokens and key-shaped strings that were never registered.

use parking_lot::RwLock;
use regex::Regex;
use std::sync::Arc;

/// Generic credential shapes masked even when the exact key is unknown:
/// `key=...` URL parameters and `Bearer ...` headers.
fn key_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?P<prefix>key=|Bearer\s+)(?P<secret>[^&\s"']+)"#).expect("valid regex")
    })
}

#[derive(Default)]
pub struct SecretStore {
    known: RwLock<Vec<String>>,
}

impl SecretStore {
    pub fn new() -> Arc<Self> {
        Arc::new(SecretStore::default())
    }

    /// Registers secrets for exact-match masking. Empty strings are ignored.
    pub fn register<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known = self.known.write();
        for secret in secrets {
            let secret = secret.into();
            if !secret.is_empty() && !known.contains(&secret) {
                known.push(secret);
            }
        }
    }

    /// Returns `text` with every known or key-shaped credential replaced.
    pub fn mask(&self, text: &str) -> String {
        let mut out = key_pattern()
            .replace_all(text, "$prefix***MASKED***")
            .into_owned();
        let known = self.known.read().clone();
        for secret in &known {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), "***MASKED***");
            }
        }
        out
    }
}

/// Short non-sensitive identifier for a key, safe to log.
pub fn key_label(key: &str) -> String {
    if key.len() <= 8 || !key.is_ascii() {
        return "key_***".to_string();
    }
    format!("key_{}…{}", &key[..4], &key[key.len() - 4..])
}

use crate::{ALLOWED_MESSAGE, DENIED_MESSAGE};
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Admits a pod when any one of its annotations has a key matching `key` and
/// a value matching `value`.
///
/// Patterns are unanchored regular expressions, so an empty pattern matches
/// every string. The compiled config is immutable and is shared by every
/// request the server handles.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    key: Regex,
    value: Regex,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid key regex: {0}")]
    Key(#[source] regex::Error),

    #[error("invalid value regex: {0}")]
    Value(#[source] regex::Error),
}

/// The outcome of evaluating a pod's annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub message: &'static str,

    /// The annotation that satisfied the policy, if any.
    pub matched: Option<Annotation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub key: String,
    pub value: String,
}

// === impl PolicyConfig ===

impl PolicyConfig {
    pub fn new(key: &str, value: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            key: Regex::new(key).map_err(ConfigError::Key)?,
            value: Regex::new(value).map_err(ConfigError::Value)?,
        })
    }

    pub fn key_pattern(&self) -> &str {
        self.key.as_str()
    }

    pub fn value_pattern(&self) -> &str {
        self.value.as_str()
    }

    /// Returns true if a single annotation satisfies both patterns.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        self.key.is_match(key) && self.value.is_match(value)
    }

    /// Scans `annotations` for the first pair that satisfies the policy.
    ///
    /// A key that matches with a value that doesn't is skipped; the scan
    /// continues with the remaining pairs. The result doesn't depend on
    /// iteration order.
    pub fn evaluate<I, K, V>(&self, annotations: I) -> Decision
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        annotations
            .into_iter()
            .find(|(k, v)| self.matches(k.as_ref(), v.as_ref()))
            .map(|(k, v)| {
                Decision::allow(Annotation {
                    key: k.as_ref().to_string(),
                    value: v.as_ref().to_string(),
                })
            })
            .unwrap_or_else(Decision::deny)
    }
}

// === impl Decision ===

impl Decision {
    fn allow(matched: Annotation) -> Self {
        Self {
            allowed: true,
            message: ALLOWED_MESSAGE,
            matched: Some(matched),
        }
    }

    fn deny() -> Self {
        Self {
            allowed: false,
            message: DENIED_MESSAGE,
            matched: None,
        }
    }
}

// === impl Annotation ===

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

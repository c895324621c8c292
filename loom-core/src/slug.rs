//! Slug normalization.
//!
//! Slugs address routes inside a dispatch prefix and are restricted to
//! `[a-z0-9-]+` with no leading, trailing, or doubled hyphens.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A normalized route slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

impl Slug {
    /// Normalizes `raw` into a slug.
    ///
    /// ASCII letters are lower-cased, every run of characters outside
    /// `[a-z0-9]` collapses into a single `-`, and hyphens are trimmed from
    /// both ends.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidSlug`] if nothing of `[a-z0-9]` remains.
    pub fn normalize(raw: &str) -> Result<Self, CoreError> {
        let mut out = String::with_capacity(raw.len());
        let mut pending_dash = false;
        for c in raw.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                if pending_dash && !out.is_empty() {
                    out.push('-');
                }
                pending_dash = false;
                out.push(c);
            } else {
                pending_dash = true;
            }
        }
        if out.is_empty() {
            return Err(CoreError::InvalidSlug { raw: raw.to_owned() });
        }
        Ok(Self(out))
    }

    /// Returns the slug as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Slug {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::normalize(&value)
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.0
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

//! Cache key definitions.
//!
//! A [`CacheKey`] is the logical key that writers and invalidators derive
//! independently. Before it reaches the backend it is namespaced and hashed
//! with [`hash_key`].

use std::fmt;

use sha2::{Digest, Sha224};

/// Logical cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `<type-qualified-name>::<value>`, the key for an identifier lookup.
    pub fn for_entity(type_name: &str, value: &str) -> Self {
        Self(format!("{type_name}::{value}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key template with positional `{}` placeholders, e.g.
/// `account::followers::account-id-{}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate(String);

impl KeyTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn placeholder_count(&self) -> usize {
        self.0.matches("{}").count()
    }

    /// Substitute `values` into the placeholders in order.
    ///
    /// Placeholders without a value are left as-is; surplus values are ignored.
    pub fn render<S: AsRef<str>>(&self, values: &[S]) -> CacheKey {
        let mut rendered = String::with_capacity(self.0.len());
        let mut values = values.iter();
        let mut rest = self.0.as_str();
        while let Some(index) = rest.find("{}") {
            rendered.push_str(&rest[..index]);
            match values.next() {
                Some(value) => rendered.push_str(value.as_ref()),
                None => rendered.push_str("{}"),
            }
            rest = &rest[index + 2..];
        }
        rendered.push_str(rest);
        CacheKey(rendered)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-224 hex digest of `prefix + key`.
pub fn hash_key(prefix: &str, key: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(prefix.as_bytes());
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

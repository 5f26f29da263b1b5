use std::fmt::{self, Write};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

/// A single component of a logical cache key.
///
/// Components are encoded with a type tag, so values of different types never
/// collide: `KeyPart::Null`, [`KeyPart::Unset`] and `KeyPart::Bool(false)`
/// all produce distinct tokens, as do `Int(1)` and `Text("1")`.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    /// An explicit "null" component.
    Null,
    /// An explicit "no value" component, distinct from [`KeyPart::Null`].
    Unset,
    /// A nested sequence, flattened into the surrounding key before encoding.
    List(Vec<KeyPart>),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for KeyPart {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for KeyPart {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

impl From<Vec<KeyPart>> for KeyPart {
    fn from(value: Vec<KeyPart>) -> Self {
        Self::List(value)
    }
}

impl<P: Into<KeyPart>> From<Option<P>> for KeyPart {
    fn from(value: Option<P>) -> Self {
        match value {
            Some(part) => part.into(),
            None => Self::Unset,
        }
    }
}

/// The canonical encoding of a logical cache key.
///
/// Two keys address the same cache entry iff their canonical encodings are
/// byte-identical. The encoding depends only on component values, never on
/// object identity, so rebuilding an equal key always lands on the same
/// entry. Cloning is cheap; keys are shared between the registry map, reload
/// handles and bindings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    canonical: Arc<str>,
}

impl CacheKey {
    /// Creates a [`CacheKeyBuilder`] to compose a multi-part key.
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::default()
    }

    /// Builds a key from an ordered sequence of components.
    ///
    /// Nested [`KeyPart::List`] components are flattened into the component
    /// sequence, mirroring how multi-part keys are composed from a base key
    /// plus extra discriminators.
    pub fn from_parts<I>(parts: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<KeyPart>,
    {
        let mut builder = Self::builder();
        for part in parts {
            builder.push(part);
        }
        builder.build()
    }

    /// The canonical encoding.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Mixes a registry-level prefix into the encoding.
    ///
    /// Scoped keys live in a namespace of their own: no unscoped key and no
    /// key scoped under a different prefix can encode to the same string.
    pub(crate) fn scoped(&self, prefix: &str) -> CacheKey {
        let mut canonical = String::with_capacity(prefix.len() + self.canonical.len() + 2);
        canonical.push('#');
        escape_into(&mut canonical, prefix);
        canonical.push('/');
        canonical.push_str(&self.canonical);
        CacheKey {
            canonical: canonical.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::from_parts([KeyPart::from(value)])
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self::from_parts([KeyPart::from(value)])
    }
}

impl From<KeyPart> for CacheKey {
    fn from(value: KeyPart) -> Self {
        Self::from_parts([value])
    }
}

impl From<Vec<KeyPart>> for CacheKey {
    fn from(value: Vec<KeyPart>) -> Self {
        Self::from_parts(value)
    }
}

/// A builder for [`CacheKey`]s.
///
/// Accepts components in order and produces the canonical, **stable**
/// encoding. Component text is escaped so that separator characters inside a
/// component can never collide with component boundaries.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    canonical: String,
}

impl CacheKeyBuilder {
    /// Appends a component; list components are flattened.
    pub fn push(&mut self, part: impl Into<KeyPart>) -> &mut Self {
        self.encode(part.into());
        self
    }

    fn encode(&mut self, part: KeyPart) {
        match part {
            KeyPart::List(parts) => {
                for part in parts {
                    self.encode(part);
                }
            }
            KeyPart::Text(text) => {
                self.separate();
                self.canonical.push_str("s:");
                escape_into(&mut self.canonical, &text);
            }
            KeyPart::Int(value) => {
                self.separate();
                write!(self.canonical, "i:{value}").unwrap();
            }
            KeyPart::Float(value) => {
                self.separate();
                write!(self.canonical, "f:{value:?}").unwrap();
            }
            KeyPart::Bool(value) => {
                self.separate();
                write!(self.canonical, "b:{value}").unwrap();
            }
            KeyPart::Time(value) => {
                self.separate();
                let timestamp = value.to_rfc3339_opts(SecondsFormat::AutoSi, true);
                write!(self.canonical, "t:{timestamp}").unwrap();
            }
            KeyPart::Null => {
                self.separate();
                self.canonical.push('n');
            }
            KeyPart::Unset => {
                self.separate();
                self.canonical.push('u');
            }
        }
    }

    fn separate(&mut self) {
        if !self.canonical.is_empty() {
            self.canonical.push('/');
        }
    }

    /// Finalizes the key.
    pub fn build(self) -> CacheKey {
        CacheKey {
            canonical: self.canonical.into(),
        }
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            c => out.push(c),
        }
    }
}

//! Sparse field composition.
//!
//! A sparse request carries each of its optional fields with probability one
//! half, independently of every other field and every other request. The
//! fields land in a [`Container`], either a [`QueryString`] or a
//! [`JsonBody`]. An outcome with no fields at all is valid and renders as no
//! query string or as `{}` respectively.

use std::fmt;

use rand::Rng;
use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::domain::{Amount, Timestamp, TransactionType};

/// A single typed request field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Field {
    /// An account number
    Account(u32),
    /// A monetary amount
    Amount(Amount),
    /// A point in time
    Timestamp(Timestamp),
    /// A transaction type label
    TransactionType(TransactionType),
    /// A fixed label
    Label(&'static str),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account(account) => write!(f, "{account}"),
            Self::Amount(amount) => write!(f, "{amount}"),
            Self::Timestamp(ts) => write!(f, "{ts}"),
            Self::TransactionType(kind) => write!(f, "{kind}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// Somewhere fields can be placed.
pub trait Container: Default {
    /// Add `value` under `key`, replacing any earlier value for `key`.
    fn insert(&mut self, key: &'static str, value: Field);
}

/// Build a `C` keeping each candidate with probability one half.
///
/// Consumes exactly one draw from `rng` per candidate, in order.
pub fn compose<C, R, I>(rng: &mut R, candidates: I) -> C
where
    C: Container,
    R: Rng + ?Sized,
    I: IntoIterator<Item = (&'static str, Field)>,
{
    let mut container = C::default();
    for (key, value) in candidates {
        if rng.random::<bool>() {
            container.insert(key, value);
        }
    }
    container
}

/// Build a `C` holding every candidate.
pub fn fill<C, I>(candidates: I) -> C
where
    C: Container,
    I: IntoIterator<Item = (&'static str, Field)>,
{
    let mut container = C::default();
    for (key, value) in candidates {
        container.insert(key, value);
    }
    container
}

fn upsert(fields: &mut Vec<(&'static str, Field)>, key: &'static str, value: Field) {
    match fields.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => fields.push((key, value)),
    }
}

/// An ordered query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryString {
    pairs: Vec<(&'static str, Field)>,
}

impl QueryString {
    /// The included pairs, in insertion order.
    #[must_use]
    pub fn pairs(&self) -> &[(&'static str, Field)] {
        &self.pairs
    }

    /// Whether no pair was included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Whether `key` was included.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| *k == key)
    }
}

impl Container for QueryString {
    fn insert(&mut self, key: &'static str, value: Field) {
        upsert(&mut self.pairs, key, value);
    }
}

impl fmt::Display for QueryString {
    /// Renders `?k=v&k=v`, or nothing when empty. Values are
    /// form-urlencoded.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (key, value)) in self.pairs.iter().enumerate() {
            let separator = if idx == 0 { '?' } else { '&' };
            let value = value.to_string();
            let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
            write!(f, "{separator}{key}={encoded}")?;
        }
        Ok(())
    }
}

impl Serialize for QueryString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// A JSON object body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonBody {
    fields: Vec<(&'static str, Field)>,
}

impl JsonBody {
    /// The included fields, in insertion order.
    #[must_use]
    pub fn fields(&self) -> &[(&'static str, Field)] {
        &self.fields
    }

    /// The included keys, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(k, _)| *k)
    }

    /// Whether no field was included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Fails only if a timestamp cannot be rendered, see
    /// [`Timestamp::to_iso8601`].
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Container for JsonBody {
    fn insert(&mut self, key: &'static str, value: Field) {
        upsert(&mut self.fields, key, value);
    }
}

impl Serialize for JsonBody {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

//! Listener-visible headers and trailers.

use crate::codec::Header;
use crate::status::{Code, Status};

use std::collections::HashMap;

/// Key-value metadata attached to a call.
///
/// Carried twice per stream: as response headers ahead of any message, and
/// as trailers alongside the terminal status. Keys are case-insensitive and
/// stored lowercase; a key may hold several values.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: HashMap<String, Vec<String>>,
}

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `key`. Values already stored under the key are
    /// kept.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let mut key = key.into();
        key.make_ascii_lowercase();
        self.entries.entry(key).or_default().push(value.into());
    }

    fn values(&self, key: &str) -> Option<&Vec<String>> {
        self.entries.get(&key.to_ascii_lowercase())
    }

    /// First value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values(key)?.first().map(String::as_str)
    }

    /// Every value stored under `key`.
    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.values(key).map(Vec::as_slice)
    }

    /// Whether `key` holds at least one value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values(key).is_some()
    }

    /// Visit every key-value pair, repeating the key for each of its
    /// values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(key, values)| {
            values.iter().map(move |value| (key.as_str(), value.as_str()))
        })
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of values across all keys.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Convert an inbound header block. Fields that are not valid UTF-8 are
    /// dropped.
    pub fn from_headers(headers: &[Header]) -> Self {
        let mut metadata = Metadata::new();
        for header in headers {
            let Ok(name) = std::str::from_utf8(&header.name) else {
                continue;
            };
            let Ok(value) = std::str::from_utf8(&header.value) else {
                continue;
            };
            metadata.insert(name, value);
        }
        metadata
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Metadata::new(), |mut metadata, (key, value)| {
                metadata.insert(key, value);
                metadata
            })
    }
}

/// Extract the terminal status from response trailers.
///
/// Reads `grpc-status` and `grpc-message`. A missing or unparsable
/// `grpc-status` yields INTERNAL.
pub fn status_from_trailers(trailers: &Metadata) -> Status {
    let Some(code) = trailers.get("grpc-status").and_then(|s| s.parse::<u32>().ok()) else {
        return Status::internal("missing grpc-status in trailers");
    };
    let code = Code::from_u32(code);
    match trailers.get("grpc-message") {
        Some(msg) => Status::new(code, msg),
        None => Status::from_code(code),
    }
}

//! HTTP header collection
//!
//! This module provides the ordered field list used for HTTP/2 request
//! headers, response headers and trailers. Lookups are case-insensitive and
//! a name may carry multiple values.

use std::fmt;

/// Per-field overhead counted by HTTP/2 header list size accounting
/// (RFC 9113 Section 6.5.2)
pub const HEADER_FIELD_OVERHEAD: usize = 32;

/// HTTP headers collection
///
/// Headers are stored in insertion order and support:
/// - Case-insensitive header name lookups
/// - Multiple values for the same header name
/// - Conversion to and from the byte pairs the HPACK codec works with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Append a header, keeping any existing values for the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replace all values of a header with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.headers.push((name, value.into()));
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all instances of a header (case-insensitive)
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.headers.len()
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Clear all headers
    pub fn clear(&mut self) {
        self.headers.clear();
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Iterate over all headers as byte slices, the form the HPACK encoder takes
    pub fn iter_bytes(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers
            .iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
    }

    /// Uncompressed size of the list as HTTP/2 accounts for it
    pub fn list_size(&self) -> usize {
        self.headers
            .iter()
            .map(|(n, v)| n.len() + v.len() + HEADER_FIELD_OVERHEAD)
            .sum()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Headers {
            headers: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut headers = Headers::new();
        headers.insert("content-type", "text/html");
        headers.insert("content-length", "42");

        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("content-length"), Some("42"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("content-type", "text/html");

        assert_eq!(headers.get("Content-Type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn test_multiple_values() {
        let mut headers = Headers::new();
        headers.insert("set-cookie", "a=1");
        headers.insert("set-cookie", "b=2");

        assert_eq!(headers.get_all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(headers.get("set-cookie"), Some("a=1"));
    }

    #[test]
    fn test_set_replaces() {
        let mut headers = Headers::new();
        headers.insert("x-a", "1");
        headers.insert("x-a", "2");
        headers.set("X-A", "3");

        assert_eq!(headers.get_all("x-a"), vec!["3"]);
    }

    #[test]
    fn test_remove() {
        let mut headers = Headers::new();
        headers.insert("x-remove", "value1");
        headers.insert("x-keep", "value2");
        headers.insert("x-remove", "value3");

        assert_eq!(headers.remove("x-remove"), 2);
        assert!(!headers.contains("x-remove"));
        assert_eq!(headers.get("x-keep"), Some("value2"));
    }

    #[test]
    fn test_list_size() {
        let headers: Headers = [("a", "bc"), ("def", "")].into_iter().collect();
        assert_eq!(headers.list_size(), 3 + 32 + 3 + 32);
    }

    #[test]
    fn test_iter_bytes_preserves_order() {
        let headers: Headers = [("a", "1"), ("b", "2")].into_iter().collect();
        let collected: Vec<_> = headers.iter_bytes().collect();
        assert_eq!(collected, vec![(&b"a"[..], &b"1"[..]), (&b"b"[..], &b"2"[..])]);
    }
}

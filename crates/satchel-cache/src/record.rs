use bytes::Bytes;
use std::fmt;

/// What the requester intends to render the response as.
///
/// Only `Document` changes engine behavior: a navigation that fails with
/// nothing cached gets the app shell instead of a synthesized error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Document,
    Media,
    Other,
}

/// Transient view of one intercepted request. Lives only while the request
/// is being handled; never persisted.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// Uppercase HTTP method.
    pub method: String,
    /// Path plus query string, leading slash.
    pub path: String,
    pub destination: Destination,
    /// Headers of interest to the upstream (content negotiation, auth).
    pub headers: Vec<(String, String)>,
    /// Request body, forwarded verbatim for unsafe methods. Empty for GET.
    pub body: Bytes,
}

impl RequestRecord {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            destination: Destination::Other,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// A plain GET with no interesting headers — manifest prefetches and
    /// most intercepted reads look like this.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.path)
    }

    /// Path with the query string stripped, for suffix/prefix rules.
    pub fn path_without_query(&self) -> &str {
        match self.path.split_once('?') {
            Some((path, _)) => path,
            None => &self.path,
        }
    }
}

/// Identity of a request across stores: method plus normalized path.
///
/// Normalization keeps the query (API responses differ per query), strips
/// any fragment, and forces a leading slash so `a.pdf` and `/a.pdf` are
/// the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(method: &str, path: &str) -> Self {
        let path = match path.split_once('#') {
            Some((before, _)) => before,
            None => path,
        };
        let method = method.to_ascii_uppercase();
        if path.starts_with('/') {
            Self(format!("{method}:{path}"))
        } else {
            Self(format!("{method}:/{path}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_method_and_path() {
        let key = RequestKey::new("GET", "/books/a.pdf");
        assert_eq!(key.as_str(), "GET:/books/a.pdf");
    }

    #[test]
    fn key_uppercases_method() {
        assert_eq!(RequestKey::new("get", "/x"), RequestKey::new("GET", "/x"));
    }

    #[test]
    fn key_keeps_query_strips_fragment() {
        let key = RequestKey::new("GET", "/api/chapters/math?page=2#section");
        assert_eq!(key.as_str(), "GET:/api/chapters/math?page=2");
    }

    #[test]
    fn key_forces_leading_slash() {
        assert_eq!(RequestKey::new("GET", "a.pdf"), RequestKey::new("GET", "/a.pdf"));
    }

    #[test]
    fn record_key_matches_standalone_key() {
        let req = RequestRecord::get("/api/chapters/math?page=2");
        assert_eq!(req.key(), RequestKey::new("GET", "/api/chapters/math?page=2"));
    }

    #[test]
    fn path_without_query() {
        let req = RequestRecord::get("/a.pdf?download=1");
        assert_eq!(req.path_without_query(), "/a.pdf");

        let req = RequestRecord::get("/a.pdf");
        assert_eq!(req.path_without_query(), "/a.pdf");
    }
}

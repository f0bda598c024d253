use crate::record::RequestRecord;

/// Which caching strategy handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Content document that never changes once published. Cache-first,
    /// captured into the dynamic store on first fetch.
    ImmutableAsset,
    /// Data endpoint where freshness wins. Network-first, cache as the
    /// offline fallback.
    ApiPassthrough,
    /// Any other safe read, including the app shell itself. Cache-first.
    GenericStatic,
    /// Unsafe method matched by no rule: straight to the network, no
    /// store interaction.
    Bypass,
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyDecision::ImmutableAsset => "immutable",
            PolicyDecision::ApiPassthrough => "api",
            PolicyDecision::GenericStatic => "generic",
            PolicyDecision::Bypass => "bypass",
        }
    }
}

/// Maps each request to exactly one [`PolicyDecision`].
///
/// Pure function of the request shape. Rules run in precedence order and
/// the first match wins, so a document suffix under the API prefix is
/// still an immutable asset.
#[derive(Debug, Clone)]
pub struct Classifier {
    api_prefix: String,
    document_suffixes: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            api_prefix: "/api/".to_string(),
            document_suffixes: vec![".pdf".to_string()],
        }
    }
}

impl Classifier {
    pub fn new(api_prefix: impl Into<String>, document_suffixes: Vec<String>) -> Self {
        Self {
            api_prefix: api_prefix.into(),
            document_suffixes,
        }
    }

    pub fn classify(&self, req: &RequestRecord) -> PolicyDecision {
        let path = req.path_without_query();

        if self
            .document_suffixes
            .iter()
            .any(|suffix| ends_with_ignore_case(path, suffix))
        {
            return PolicyDecision::ImmutableAsset;
        }

        if path.starts_with(&self.api_prefix) {
            return PolicyDecision::ApiPassthrough;
        }

        if req.is_get() {
            return PolicyDecision::GenericStatic;
        }

        PolicyDecision::Bypass
    }
}

fn ends_with_ignore_case(path: &str, suffix: &str) -> bool {
    path.len() >= suffix.len() && path[path.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use satchel_cache::{CachedResponse, Fetch, NetworkError, RequestRecord};
use std::future::Future;
use std::time::Duration;

pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>;

/// The engine's network seam, backed by a real HTTP client pointed at the
/// configured upstream.
///
/// Every failure mode — refused connection, reset, body read error,
/// timeout — maps to [`NetworkError`]; the engine treats them all the same.
pub struct HttpUpstream {
    client: HttpClient,
    base_url: String,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn send(&self, req: &RequestRecord) -> Result<CachedResponse, NetworkError> {
        let uri = format!("{}{}", self.base_url, req.path);

        let mut builder = hyper::Request::builder().method(req.method.as_str()).uri(&uri);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Full::new(req.body.clone()))
            .map_err(|e| NetworkError::new(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| NetworkError::new(format!("upstream timeout after {:?}", self.timeout)))?
            .map_err(|e| NetworkError::new(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| NetworkError::new(e.to_string()))?
            .to_bytes();

        Ok(CachedResponse::new(status, headers, body))
    }
}

impl Fetch for HttpUpstream {
    fn fetch(
        &self,
        req: &RequestRecord,
    ) -> impl Future<Output = Result<CachedResponse, NetworkError>> + Send {
        self.send(req)
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "transfer-encoding"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "upgrade"
    )
}

//! HTTP plumbing behind the search client.

use serde::de::DeserializeOwned;

/// Raw outcome of one POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl HttpResponse {
    /// Create a response
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Failure to get any HTTP response at all
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// reqwest failed to build, send or read the request
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// A non-reqwest transport gave up
    #[error("{0}")]
    Other(String),
}

/// Anything that can POST a JSON body and hand back status plus text.
pub trait HttpTransport {
    /// POST `body` to `url` with `Authorization: <auth>`
    fn post_json(&self, url: &str, auth: &str, body: &serde_json::Value) -> Result<HttpResponse, TransportError>;
}

/// Blocking reqwest transport with reqwest's default timeouts.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    /// Build the underlying client
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("unpacme-search/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn post_json(&self, url: &str, auth: &str, body: &serde_json::Value) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", auth)
            .json(body)
            .send()?;

        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(HttpResponse { status, body })
    }
}

//! UnpacMe term-search client.
//!
//! A search is one POST against the malware corpus, optionally followed by a
//! second POST against the goodware repository. Failures never escape as
//! panics: [`SearchClient::search`] turns every error into one user notice
//! and an empty result.

use std::fmt;
use std::rc::Rc;

use serde_json::json;

use crate::logging::{log_debug, log_error, Logger};

pub mod model;
pub mod transport;

pub use self::model::{
    AnalysisRef, ClassificationEntry, GoodwareMatch, GoodwareMetadata, MalwareMatch, SearchResult,
    PRIMARY_CLASSIFIER,
};
pub use self::transport::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};

use self::model::{GoodwareResponse, NotFoundBody};

/// API root
pub const DEFAULT_BASE_URL: &str = "https://api.unpac.me/api/";
/// API version path component
pub const API_VERSION: &str = "v1";
/// Term-search endpoint below the version
pub const SEARCH_ENDPOINT: &str = "/private/search/term/";

/// Shown after any server warning when nothing matched
pub const NO_RESULTS: &str = "No results found for the pattern.";

/// How the service should interpret the search value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SearchEncoding {
    /// Space-separated hex bytes with `??` wildcards
    #[default]
    Hex,
    /// ASCII string
    Ascii,
    /// UTF-16LE string
    Wide,
}

impl SearchEncoding {
    /// URL suffix selecting the search type
    pub fn suffix(self) -> &'static str {
        match self {
            SearchEncoding::Hex => "string.hex",
            SearchEncoding::Ascii => "string.ascii",
            SearchEncoding::Wide => "string.wide",
        }
    }
}

impl fmt::Display for SearchEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchEncoding::Hex => write!(f, "hex"),
            SearchEncoding::Ascii => write!(f, "ascii"),
            SearchEncoding::Wide => write!(f, "wide"),
        }
    }
}

/// Why a search produced no result
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The primary lookup answered 404
    #[error("No results found for the pattern.")]
    NotFound {
        /// Server-supplied explanation, if any
        warning: Option<String>,
    },

    /// The primary lookup answered something other than 200 or 404
    #[error("Unexpected response from UnpacMe...please try again. Code: {0}")]
    Status(u16),

    /// No response at all
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A 200 body that did not parse
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Refused to search with an empty credential
    #[error("No API Key found!")]
    MissingApiKey,
}

/// User-facing notices and the progress indicator.
pub trait Notifier {
    /// Show a modal warning
    fn warning(&self, text: &str);

    /// Show the wait box with `text`
    fn show_wait_box(&self, text: &str);

    /// Change the text of the visible wait box
    fn replace_wait_box(&self, text: &str);

    /// Remove the wait box
    fn hide_wait_box(&self);
}

/// Keeps the wait box up for as long as it lives.
pub struct WaitBox<'a> {
    ui: &'a dyn Notifier,
}

impl<'a> WaitBox<'a> {
    /// Show the wait box
    pub fn show(ui: &'a dyn Notifier, text: &str) -> Self {
        ui.show_wait_box(text);
        Self { ui }
    }

    /// Update its text
    pub fn replace(&self, text: &str) {
        self.ui.replace_wait_box(text);
    }
}

impl Drop for WaitBox<'_> {
    fn drop(&mut self) {
        self.ui.hide_wait_box();
    }
}

/// Authenticated client for the term-search endpoint.
pub struct SearchClient {
    transport: Rc<dyn HttpTransport>,
    auth: String,
    base_url: String,
}

impl SearchClient {
    /// Create a client; an empty key is refused up front.
    pub fn new(api_key: &str, transport: Rc<dyn HttpTransport>) -> Result<Self, SearchError> {
        let key = api_key.trim();
        if key.is_empty() {
            return Err(SearchError::MissingApiKey);
        }
        Ok(Self {
            transport,
            auth: format!("Key {}", key),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the client at another API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Full URL for a search of the given encoding
    pub fn url(&self, encoding: SearchEncoding) -> String {
        format!("{}{}{}{}", self.base_url, API_VERSION, SEARCH_ENDPOINT, encoding.suffix())
    }

    /// Run a search and report failures to the user.
    ///
    /// Returns `None` for every kind of failure after surfacing exactly one
    /// notice for it (404 may additionally surface the server's warning).
    pub fn search(
        &self,
        ui: &dyn Notifier,
        log: &Logger,
        pattern: &str,
        encoding: SearchEncoding,
        include_goodware: bool,
    ) -> Option<SearchResult> {
        match self.try_search(ui, log, pattern, encoding, include_goodware) {
            Ok(result) => Some(result),
            Err(SearchError::NotFound { warning }) => {
                if let Some(warning) = warning {
                    ui.warning(&warning);
                }
                ui.warning(NO_RESULTS);
                None
            }
            Err(e @ SearchError::Status(_)) => {
                log_error!(log, "Error in search...try again {}", e);
                ui.warning(&e.to_string());
                None
            }
            Err(e) => {
                log_error!(log, "Error making request {}", e);
                ui.warning(&format!("Unexpected error UnpacMe...please try again. {}", e));
                None
            }
        }
    }

    /// Run a search, returning failures instead of reporting them.
    ///
    /// An unexpected goodware status is not an error: it is surfaced and the
    /// malware results are returned with empty goodware fields. A transport
    /// fault or unreadable body on either request fails the whole search.
    pub fn try_search(
        &self,
        ui: &dyn Notifier,
        log: &Logger,
        pattern: &str,
        encoding: SearchEncoding,
        include_goodware: bool,
    ) -> Result<SearchResult, SearchError> {
        let wait = WaitBox::show(ui, "Searching...");

        let url = self.url(encoding);
        log_debug!(log, "URL: {}", url);
        let mut body = json!({ "value": pattern });
        log_debug!(log, "Search Data: {}", body);

        let response = self.transport.post_json(&url, &self.auth, &body)?;
        wait.replace("Processing results.");
        log_debug!(log, "Status: {}", response.status);

        match response.status {
            200 => {}
            404 => {
                let warning = response.json::<NotFoundBody>().ok().and_then(|b| b.warning);
                return Err(SearchError::NotFound { warning });
            }
            status => return Err(SearchError::Status(status)),
        }

        let mut result: SearchResult = response.json()?;

        if !include_goodware {
            result.clear_goodware();
            return Ok(result);
        }

        log_debug!(log, "Searching Goodware");
        wait.replace("Searching goodware...");
        body["repo_type"] = json!("goodware");
        let goodware = self.transport.post_json(&url, &self.auth, &body)?;
        wait.replace("Processing results...");

        match goodware.status {
            200 => {
                let found: GoodwareResponse = goodware.json()?;
                result.goodware_results = found.goodware_results;
                result.matched_goodware_files = found.matched_goodware_files;
            }
            404 => result.clear_goodware(),
            status => {
                log_error!(log, "Error while searching ..{}", status);
                ui.warning("Unexpected response from UnpacMe...please try again");
                result.clear_goodware();
            }
        }

        Ok(result)
    }
}

impl fmt::Debug for SearchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

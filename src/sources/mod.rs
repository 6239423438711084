//! Source adapters: one per image-search API, all normalizing into
//! [`CandidateImage`] so nothing downstream branches on provider identity.

pub mod pexels;
pub mod pixabay;
pub mod unsplash;

use anyhow::Result;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ProviderError;
use crate::http::{HttpError, HttpRequest, Transport};
use crate::model::CandidateImage;

pub use pexels::PexelsAdapter;
pub use pixabay::PixabayAdapter;
pub use unsplash::UnsplashAdapter;

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub candidates: Vec<CandidateImage>,
    /// `None` once the provider signals exhaustion.
    pub next_page_token: Option<String>,
}

pub trait SourceAdapter: Send + Sync {
    fn provider(&self) -> &str;

    /// Fetch one page. `page_token` is `None` for the first page.
    fn fetch_page(&self, query: &str, page_token: Option<&str>) -> Result<Page, ProviderError>;

    /// Token of the page after `page_token`, used to skip a page that failed
    /// permanently. Adapters with opaque cursors cannot skip and return `None`.
    fn page_after(&self, _page_token: Option<&str>) -> Option<String> {
        None
    }
}

/// Build the adapter for a configured provider.
pub fn create_adapter(
    config: &ProviderConfig,
    transport: Arc<dyn Transport>,
) -> Result<Box<dyn SourceAdapter>> {
    let api_key = config.resolve_api_key()?;
    let base_url = config.base_url();
    let page_size = config.page_size();

    Ok(match config.kind {
        ProviderKind::Pixabay => {
            Box::new(PixabayAdapter::new(transport, base_url, api_key, page_size))
        }
        ProviderKind::Unsplash => {
            Box::new(UnsplashAdapter::new(transport, base_url, api_key, page_size))
        }
        ProviderKind::Pexels => {
            Box::new(PexelsAdapter::new(transport, base_url, api_key, page_size))
        }
    })
}

/// Ceiling on a search response body unless the request sets its own.
pub const SEARCH_RESPONSE_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Send a search request and map transport and status failures onto [`ProviderError`].
pub(crate) fn send(
    provider: &str,
    transport: &dyn Transport,
    request: &HttpRequest,
) -> Result<Vec<u8>, ProviderError> {
    let capped;
    let request = if request.max_bytes.is_some() {
        request
    } else {
        capped = request.clone().max_bytes(SEARCH_RESPONSE_MAX_BYTES);
        &capped
    };
    let response = transport.get(request).map_err(|e| match e {
        HttpError::Transport(msg) => ProviderError::transport(provider, msg),
        HttpError::TooLarge { limit } => {
            ProviderError::malformed(provider, format!("response exceeds {} bytes", limit))
        }
    })?;

    if !response.is_success() {
        let snippet: String = String::from_utf8_lossy(&response.body)
            .chars()
            .take(200)
            .collect();
        return Err(ProviderError::from_status(provider, response.status, snippet));
    }

    Ok(response.body)
}

pub(crate) fn parse_json<T: DeserializeOwned>(provider: &str, body: &[u8]) -> Result<T, ProviderError> {
    serde_json::from_slice(body)
        .map_err(|e| ProviderError::malformed(provider, format!("unexpected response shape: {}", e)))
}

/// Page-number tokens: absent means the first page.
pub(crate) fn page_number(provider: &str, page_token: Option<&str>) -> Result<u32, ProviderError> {
    match page_token {
        None => Ok(1),
        Some(token) => token
            .parse::<u32>()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| ProviderError::malformed(provider, format!("bad page token {:?}", token))),
    }
}

pub(crate) fn next_page_number(page_token: Option<&str>) -> Option<String> {
    let current = match page_token {
        None => 1,
        Some(token) => token.parse::<u32>().ok()?,
    };
    Some((current + 1).to_string())
}

/// Pixabay sends tags as one comma-separated string.
pub(crate) fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

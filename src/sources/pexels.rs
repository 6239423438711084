use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use super::{next_page_number, page_number, parse_json, send, Page, SourceAdapter};
use crate::error::ProviderError;
use crate::http::{HttpRequest, Transport};
use crate::model::CandidateImage;

const PROVIDER: &str = "pexels";

pub struct PexelsAdapter {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: String,
    per_page: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    photos: Vec<Photo>,
    /// Full URL of the next page; absent on the last one.
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    id: u64,
    width: Option<u32>,
    height: Option<u32>,
    src: PhotoSrc,
    #[serde(default)]
    alt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoSrc {
    original: Option<String>,
    large2x: Option<String>,
}

impl PexelsAdapter {
    pub fn new(transport: Arc<dyn Transport>, base_url: String, api_key: String, per_page: u32) -> Self {
        Self {
            transport,
            base_url,
            api_key,
            per_page: per_page.clamp(1, 80),
        }
    }
}

impl SourceAdapter for PexelsAdapter {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn fetch_page(&self, query: &str, page_token: Option<&str>) -> Result<Page, ProviderError> {
        let page = page_number(PROVIDER, page_token)?;

        let request = HttpRequest::get(format!("{}/v1/search", self.base_url))
            .query("query", query)
            .query("page", page)
            .query("per_page", self.per_page)
            .header("Authorization", self.api_key.clone());

        let body = send(PROVIDER, self.transport.as_ref(), &request)?;
        let response: SearchResponse = parse_json(PROVIDER, &body)?;

        let exhausted = response.photos.is_empty() || response.next_page.is_none();

        let now = Utc::now();
        let candidates = response
            .photos
            .into_iter()
            .filter_map(|photo| {
                let url = photo.src.original.or(photo.src.large2x)?;
                let tags = photo
                    .alt
                    .map(|alt| alt.trim().to_lowercase())
                    .filter(|alt| !alt.is_empty())
                    .into_iter()
                    .collect();
                Some(CandidateImage {
                    provider: PROVIDER.to_string(),
                    provider_native_id: photo.id.to_string(),
                    source_url: url,
                    query_tags: tags,
                    search_query: query.to_string(),
                    declared_width: photo.width,
                    declared_height: photo.height,
                    discovered_at: now,
                })
            })
            .collect();

        Ok(Page {
            candidates,
            next_page_token: if exhausted { None } else { Some((page + 1).to_string()) },
        })
    }

    fn page_after(&self, page_token: Option<&str>) -> Option<String> {
        next_page_number(page_token)
    }
}

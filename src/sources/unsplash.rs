use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use super::{next_page_number, page_number, parse_json, send, Page, SourceAdapter};
use crate::error::ProviderError;
use crate::http::{HttpRequest, Transport};
use crate::model::CandidateImage;

const PROVIDER: &str = "unsplash";

pub struct UnsplashAdapter {
    transport: Arc<dyn Transport>,
    base_url: String,
    access_key: String,
    per_page: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total_pages: Option<u32>,
    #[serde(default)]
    results: Vec<Photo>,
}

#[derive(Debug, Deserialize)]
struct Photo {
    id: String,
    width: Option<u32>,
    height: Option<u32>,
    urls: PhotoUrls,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct PhotoUrls {
    full: Option<String>,
    regular: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    title: String,
}

impl UnsplashAdapter {
    pub fn new(transport: Arc<dyn Transport>, base_url: String, access_key: String, per_page: u32) -> Self {
        Self {
            transport,
            base_url,
            access_key,
            per_page: per_page.clamp(1, 30),
        }
    }
}

impl SourceAdapter for UnsplashAdapter {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn fetch_page(&self, query: &str, page_token: Option<&str>) -> Result<Page, ProviderError> {
        let page = page_number(PROVIDER, page_token)?;

        let request = HttpRequest::get(format!("{}/search/photos", self.base_url))
            .query("query", query)
            .query("page", page)
            .query("per_page", self.per_page)
            .query("content_filter", "high")
            .header("Authorization", format!("Client-ID {}", self.access_key))
            .header("Accept-Version", "v1");

        let body = send(PROVIDER, self.transport.as_ref(), &request)?;
        let response: SearchResponse = parse_json(PROVIDER, &body)?;

        let exhausted = response.results.is_empty()
            || response.total_pages.map_or(true, |total| page >= total);

        let now = Utc::now();
        let candidates = response
            .results
            .into_iter()
            .filter_map(|photo| {
                let url = photo.urls.full.or(photo.urls.regular)?;
                Some(CandidateImage {
                    provider: PROVIDER.to_string(),
                    provider_native_id: photo.id,
                    source_url: url,
                    query_tags: photo.tags.into_iter().map(|t| t.title.to_lowercase()).collect(),
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

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{next_page_number, page_number, parse_json, send, split_tags, Page, SourceAdapter};
use crate::error::ProviderError;
use crate::http::{HttpRequest, Transport};
use crate::model::CandidateImage;

const PROVIDER: &str = "pixabay";

pub struct PixabayAdapter {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: String,
    per_page: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    total_hits: Option<u64>,
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hit {
    id: u64,
    #[serde(rename = "largeImageURL")]
    large_image_url: Option<String>,
    #[serde(rename = "webformatURL")]
    webformat_url: Option<String>,
    image_width: Option<u32>,
    image_height: Option<u32>,
    #[serde(default)]
    tags: String,
}

impl PixabayAdapter {
    pub fn new(transport: Arc<dyn Transport>, base_url: String, api_key: String, per_page: u32) -> Self {
        Self {
            transport,
            base_url,
            api_key,
            // the API rejects per_page outside 3..=200
            per_page: per_page.clamp(3, 200),
        }
    }
}

impl SourceAdapter for PixabayAdapter {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn fetch_page(&self, query: &str, page_token: Option<&str>) -> Result<Page, ProviderError> {
        let page = page_number(PROVIDER, page_token)?;

        let request = HttpRequest::get(format!("{}/api/", self.base_url))
            .query("key", &self.api_key)
            .query("q", query)
            .query("image_type", "photo")
            .query("per_page", self.per_page)
            .query("page", page)
            .query("safesearch", "true");

        let body = send(PROVIDER, self.transport.as_ref(), &request)?;
        let response: SearchResponse = parse_json(PROVIDER, &body)?;

        let hit_count = response.hits.len();
        let now = Utc::now();
        let candidates = response
            .hits
            .into_iter()
            .filter_map(|hit| {
                let Some(url) = hit.large_image_url.or(hit.webformat_url) else {
                    debug!(id = hit.id, "Pixabay hit without an image URL");
                    return None;
                };
                Some(CandidateImage {
                    provider: PROVIDER.to_string(),
                    provider_native_id: hit.id.to_string(),
                    source_url: url,
                    query_tags: split_tags(&hit.tags),
                    search_query: query.to_string(),
                    declared_width: hit.image_width,
                    declared_height: hit.image_height,
                    discovered_at: now,
                })
            })
            .collect();

        let seen = u64::from(page) * u64::from(self.per_page);
        let exhausted = hit_count < self.per_page as usize
            || response.total_hits.is_some_and(|total| seen >= total);

        Ok(Page {
            candidates,
            next_page_token: if exhausted { None } else { Some((page + 1).to_string()) },
        })
    }

    fn page_after(&self, page_token: Option<&str>) -> Option<String> {
        next_page_number(page_token)
    }
}

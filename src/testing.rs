//! Fakes and fixtures shared by unit tests.

use chrono::Utc;
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ProviderError;
use crate::http::{HttpError, HttpRequest, HttpResponse, Transport};
use crate::model::CandidateImage;
use crate::sources::{next_page_number, Page, SourceAdapter};

type Scripted<T> = Mutex<HashMap<String, VecDeque<T>>>;

/// Pop the next scripted value; the last one repeats forever.
fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// In-memory [`Transport`] keyed by URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Scripted<Result<HttpResponse, HttpError>>,
    requests: Mutex<Vec<HttpRequest>>,
    /// Wall-clock delay before every response.
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push(&self, url: &str, response: Result<HttpResponse, HttpError>) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_json(&self, url: &str, value: serde_json::Value) {
        self.push(
            url,
            Ok(HttpResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: serde_json::to_vec(&value).unwrap(),
            }),
        );
    }

    pub fn push_status(&self, url: &str, status: u16, body: &str) {
        self.push(
            url,
            Ok(HttpResponse {
                status,
                content_type: Some("text/plain".to_string()),
                body: body.as_bytes().to_vec(),
            }),
        );
    }

    pub fn push_transport_error(&self, url: &str, message: &str) {
        self.push(url, Err(HttpError::Transport(message.to_string())));
    }

    pub fn push_image(&self, url: &str, bytes: Vec<u8>, content_type: Option<&str>) {
        self.push(
            url,
            Ok(HttpResponse {
                status: 200,
                content_type: content_type.map(|s| s.to_string()),
                body: bytes,
            }),
        );
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.url == url).count()
    }
}

impl Transport for ScriptedTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let scripted = self
            .routes
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(next_scripted);

        let response = scripted.unwrap_or_else(|| {
            Ok(HttpResponse {
                status: 404,
                content_type: None,
                body: Vec::new(),
            })
        })?;

        if let Some(limit) = request.max_bytes {
            if response.body.len() as u64 > limit {
                return Err(HttpError::TooLarge { limit });
            }
        }
        Ok(response)
    }
}

/// [`SourceAdapter`] serving pages scripted per `(query, page_token)`.
/// Unscripted pages are empty and final.
pub struct ScriptedAdapter {
    provider: String,
    pages: Scripted<Result<Page, ProviderError>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedAdapter {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            pages: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn key(query: &str, token: Option<&str>) -> String {
        format!("{}#{}", query, token.unwrap_or(""))
    }

    pub fn push_page(&self, query: &str, token: Option<&str>, page: Result<Page, ProviderError>) {
        self.pages
            .lock()
            .unwrap()
            .entry(Self::key(query, token))
            .or_default()
            .push_back(page);
    }

    /// A single final page holding `candidates`.
    pub fn with_candidates(self, query: &str, candidates: Vec<CandidateImage>) -> Self {
        self.push_page(
            query,
            None,
            Ok(Page {
                candidates,
                next_page_token: None,
            }),
        );
        self
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl SourceAdapter for ScriptedAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn fetch_page(&self, query: &str, page_token: Option<&str>) -> Result<Page, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((query.to_string(), page_token.map(|t| t.to_string())));

        self.pages
            .lock()
            .unwrap()
            .get_mut(&Self::key(query, page_token))
            .and_then(next_scripted)
            .unwrap_or_else(|| Ok(Page::default()))
    }

    fn page_after(&self, page_token: Option<&str>) -> Option<String> {
        next_page_number(page_token)
    }
}

pub fn candidate(provider: &str, id: &str, url: &str) -> CandidateImage {
    CandidateImage {
        provider: provider.to_string(),
        provider_native_id: id.to_string(),
        source_url: url.to_string(),
        query_tags: vec!["guitar".to_string()],
        search_query: "guitar".to_string(),
        declared_width: None,
        declared_height: None,
        discovered_at: Utc::now(),
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// An 8x8 grid of random colour blocks. Distinct seeds give visually
/// unrelated images; channel values stay within 20..=230.
pub fn block_image(seed: u64, width: u32, height: u32) -> RgbImage {
    let mut state = seed;
    let mut blocks = [[[0u8; 3]; 8]; 8];
    for row in blocks.iter_mut() {
        for block in row.iter_mut() {
            for channel in block.iter_mut() {
                *channel = 20 + (splitmix64(&mut state) % 211) as u8;
            }
        }
    }

    RgbImage::from_fn(width, height, |x, y| {
        let bx = (x * 8 / width) as usize;
        let by = (y * 8 / height) as usize;
        Rgb(blocks[by][bx])
    })
}

/// Same picture, uniformly brighter.
pub fn brighten(img: &RgbImage, delta: u8) -> RgbImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = channel.saturating_add(delta);
        }
    }
    out
}

pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
    bytes
}

pub fn jpeg_bytes(img: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg).unwrap();
    bytes
}

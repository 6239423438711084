//! Downloads candidate bytes with a size ceiling and content-type check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::config::FetcherConfig;
use crate::error::{FetchError, ValidationError};
use crate::http::{HttpError, HttpRequest, Transport};
use crate::model::{CandidateImage, ImageContent};
use crate::rate_limit::RateLimiters;
use crate::retry::RetryPolicy;

pub struct ContentFetcher {
    transport: Arc<dyn Transport>,
    limiters: Arc<RateLimiters>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    max_bytes: u64,
    accepted_types: Vec<String>,
}

/// Lowercased media type without parameters (`image/jpeg; q=1` -> `image/jpeg`).
pub fn normalize_content_type(raw: &str) -> String {
    let media = raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match media.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => media,
    }
}

impl ContentFetcher {
    pub fn new(
        config: &FetcherConfig,
        transport: Arc<dyn Transport>,
        limiters: Arc<RateLimiters>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            limiters,
            retry,
            clock,
            max_bytes: config.max_image_bytes,
            accepted_types: config
                .accepted_content_types
                .iter()
                .map(|t| normalize_content_type(t))
                .collect(),
        }
    }

    /// Download and type-check the bytes behind `candidate.source_url`.
    ///
    /// Network failures and retriable statuses are retried with backoff; a
    /// content type outside the accepted set is a quality problem, not an error.
    pub fn fetch(&self, candidate: &CandidateImage, cancel: &AtomicBool) -> Result<ImageContent, FetchError> {
        let request = HttpRequest::get(candidate.source_url.as_str()).max_bytes(self.max_bytes);
        let limiter = self.limiters.get(&candidate.provider);

        let response = self.retry.run(
            self.clock.as_ref(),
            Some(cancel),
            |attempt| {
                if cancel.load(Ordering::SeqCst) {
                    return Err(FetchError::Cancelled);
                }
                if let Some(ref limiter) = limiter {
                    if !limiter.acquire(cancel) {
                        return Err(FetchError::Cancelled);
                    }
                }
                debug!(url = %candidate.source_url, attempt, "Downloading");

                let response = self.transport.get(&request).map_err(|e| match e {
                    HttpError::Transport(msg) => FetchError::Transport(msg),
                    HttpError::TooLarge { limit } => FetchError::TooLarge { limit },
                })?;
                if !response.is_success() {
                    return Err(FetchError::Status {
                        status: response.status,
                    });
                }
                Ok(response)
            },
            FetchError::is_retriable,
        )?;

        let content_type = match response.content_type.as_deref() {
            Some(raw) if !raw.trim().is_empty() => normalize_content_type(raw),
            _ => image::guess_format(&response.body)
                .map(|format| format.to_mime_type().to_string())
                .map_err(|_| ValidationError::UnsupportedContentType("unknown".to_string()))?,
        };

        if !self.accepted_types.contains(&content_type) {
            return Err(ValidationError::UnsupportedContentType(content_type).into());
        }

        Ok(ImageContent::new(response.body, content_type))
    }
}

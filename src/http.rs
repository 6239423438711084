//! Blocking HTTP seam shared by source adapters and the content fetcher.

use std::io::Read;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Abort the body read once it grows past this many bytes.
    pub max_bytes: Option<u64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn max_bytes(mut self, limit: u64) -> Self {
        self.max_bytes = Some(limit);
        self
    }
}

/// A completed exchange. Non-2xx statuses are returned here, not as errors.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

pub trait Transport: Send + Sync {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("fretlog/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Transport for UreqTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut req = self.agent.get(&request.url);
        for (key, value) in &request.query {
            req = req.query(key, value);
        }
        for (key, value) in &request.headers {
            req = req.set(key, value);
        }

        let response = match req.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(e)) => return Err(HttpError::Transport(e.to_string())),
        };

        let status = response.status();
        let content_type = response.header("Content-Type").map(|s| s.to_string());

        if let Some(limit) = request.max_bytes {
            let declared = response
                .header("Content-Length")
                .and_then(|len| len.trim().parse::<u64>().ok());
            if declared.is_some_and(|len| len > limit) {
                return Err(HttpError::TooLarge { limit });
            }
        }

        let mut body = Vec::new();
        let read = match request.max_bytes {
            Some(limit) => response
                .into_reader()
                .take(limit.saturating_add(1))
                .read_to_end(&mut body),
            None => response.into_reader().read_to_end(&mut body),
        };
        read.map_err(|e| HttpError::Transport(e.to_string()))?;

        if let Some(limit) = request.max_bytes {
            if body.len() as u64 > limit {
                return Err(HttpError::TooLarge { limit });
            }
        }

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

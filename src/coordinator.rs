//! Fetch coordinator: drives every provider's searches, one worker thread per
//! provider, each under its own rate limiter and backoff.
//!
//! A worker walks its provider's query list page by page and feeds candidates
//! into the shared `emit` sink. Providers never wait on one another: a slow or
//! backing-off provider only delays its own pages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::ProviderError;
use crate::model::{CandidateImage, RunCounters};
use crate::rate_limit::ProviderLimiter;
use crate::retry::RetryPolicy;
use crate::sources::{Page, SourceAdapter};

/// What one provider should search for during a run.
pub struct ProviderPlan {
    pub adapter: Arc<dyn SourceAdapter>,
    pub queries: Vec<String>,
    pub limiter: Arc<ProviderLimiter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorReport {
    pub pages_ok: u64,
    /// Pages skipped after exhausting retries or failing permanently.
    pub pages_failed: u64,
    pub candidates: u64,
}

impl CoordinatorReport {
    /// Every page request failed and none succeeded.
    pub fn all_unreachable(&self) -> bool {
        self.pages_ok == 0 && self.pages_failed > 0
    }

    fn merge(&mut self, other: CoordinatorReport) {
        self.pages_ok += other.pages_ok;
        self.pages_failed += other.pages_failed;
        self.candidates += other.candidates;
    }
}

#[derive(Debug, Error)]
enum PageError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("cancelled while waiting for the rate limiter")]
    Cancelled,
}

impl PageError {
    fn is_retriable(&self) -> bool {
        matches!(self, PageError::Provider(e) if e.retriable)
    }
}

/// Shared state of one run, borrowed by every provider worker.
struct RunContext<'a, F> {
    counters: &'a RunCounters,
    cancel: &'a AtomicBool,
    /// Set once `emit` refuses a candidate.
    closed: AtomicBool,
    emit: &'a F,
}

impl<F> RunContext<'_, F> {
    fn halted(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst)
    }
}

pub struct FetchCoordinator {
    plans: Vec<ProviderPlan>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    max_results_per_query: usize,
    max_consecutive_page_failures: u32,
}

impl FetchCoordinator {
    pub fn new(
        plans: Vec<ProviderPlan>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        max_results_per_query: usize,
        max_consecutive_page_failures: u32,
    ) -> Self {
        Self {
            plans,
            retry,
            clock,
            max_results_per_query: max_results_per_query.max(1),
            max_consecutive_page_failures: max_consecutive_page_failures.max(1),
        }
    }

    /// Run until every query is exhausted, `emit` returns `false`, or `cancel` is set.
    ///
    /// `emit` is called concurrently from the provider workers. Candidates are
    /// emitted in discovery order per provider. Permanently failed pages are
    /// counted on `counters` as errors.
    pub fn run<F>(self, counters: &RunCounters, cancel: &AtomicBool, emit: F) -> CoordinatorReport
    where
        F: Fn(CandidateImage) -> bool + Sync,
    {
        let ctx = RunContext {
            counters,
            cancel,
            closed: AtomicBool::new(false),
            emit: &emit,
        };

        let mut report = CoordinatorReport::default();
        std::thread::scope(|s| {
            let workers: Vec<_> = self
                .plans
                .iter()
                .map(|plan| {
                    let ctx = &ctx;
                    let this = &self;
                    s.spawn(move || this.search_provider(plan, ctx))
                })
                .collect();

            for worker in workers {
                match worker.join() {
                    Ok(provider_report) => report.merge(provider_report),
                    Err(_) => warn!("Search worker panicked"),
                }
            }
        });

        if cancel.load(Ordering::SeqCst) {
            info!("Cancellation requested, no further page requests");
        }
        info!(
            pages_ok = report.pages_ok,
            pages_failed = report.pages_failed,
            candidates = report.candidates,
            "Discovery finished"
        );
        report
    }

    /// Walk every query of one provider. Runs on that provider's worker thread.
    fn search_provider<F>(&self, plan: &ProviderPlan, ctx: &RunContext<'_, F>) -> CoordinatorReport
    where
        F: Fn(CandidateImage) -> bool + Sync,
    {
        let adapter = plan.adapter.as_ref();
        let mut report = CoordinatorReport::default();

        'queries: for query in &plan.queries {
            let mut token: Option<String> = None;
            let mut emitted = 0usize;
            let mut consecutive_failures = 0u32;

            loop {
                if ctx.halted() {
                    break 'queries;
                }

                match self.fetch_page(plan, query, token.as_deref(), ctx.cancel) {
                    Ok(page) => {
                        report.pages_ok += 1;
                        consecutive_failures = 0;
                        debug!(
                            provider = adapter.provider(),
                            query = %query,
                            page = token.as_deref().unwrap_or("1"),
                            results = page.candidates.len(),
                            "Fetched page"
                        );

                        for candidate in page.candidates {
                            if emitted >= self.max_results_per_query {
                                break;
                            }
                            emitted += 1;
                            report.candidates += 1;
                            if !(ctx.emit)(candidate) {
                                ctx.closed.store(true, Ordering::SeqCst);
                                break 'queries;
                            }
                        }

                        match page.next_page_token {
                            Some(next) if emitted < self.max_results_per_query => token = Some(next),
                            _ => {
                                info!(
                                    provider = adapter.provider(),
                                    query = %query,
                                    candidates = emitted,
                                    "Query exhausted"
                                );
                                continue 'queries;
                            }
                        }
                    }
                    Err(PageError::Cancelled) => break 'queries,
                    Err(PageError::Provider(_)) if ctx.cancel.load(Ordering::SeqCst) => break 'queries,
                    Err(PageError::Provider(e)) => {
                        report.pages_failed += 1;
                        ctx.counters.error();
                        consecutive_failures += 1;
                        warn!(
                            provider = adapter.provider(),
                            query = %query,
                            page = token.as_deref().unwrap_or("1"),
                            error = %e,
                            "Skipping page"
                        );

                        let next = if consecutive_failures >= self.max_consecutive_page_failures {
                            None
                        } else {
                            adapter.page_after(token.as_deref())
                        };
                        match next {
                            Some(next) => token = Some(next),
                            None => {
                                warn!(provider = adapter.provider(), query = %query, "Abandoning query");
                                continue 'queries;
                            }
                        }
                    }
                }
            }
        }

        report
    }

    /// One page, retried with backoff. Every attempt takes a limiter permit.
    fn fetch_page(
        &self,
        plan: &ProviderPlan,
        query: &str,
        token: Option<&str>,
        cancel: &AtomicBool,
    ) -> Result<Page, PageError> {
        self.retry.run(
            self.clock.as_ref(),
            Some(cancel),
            |_| {
                if !plan.limiter.acquire(cancel) {
                    return Err(PageError::Cancelled);
                }
                Ok(plan.adapter.fetch_page(query, token)?)
            },
            PageError::is_retriable,
        )
    }

    pub fn providers(&self) -> Vec<String> {
        self.plans.iter().map(|p| p.adapter.provider().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::config::RateLimitConfig;
    use crate::testing::{candidate, ScriptedAdapter};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(5),
        }
    }

    fn plan(adapter: Arc<dyn SourceAdapter>, queries: &[&str], clock: Arc<dyn Clock>, rate: f64, burst: u32) -> ProviderPlan {
        let limit = RateLimitConfig {
            requests_per_second: rate,
            burst,
        };
        ProviderPlan {
            adapter,
            queries: queries.iter().map(|q| q.to_string()).collect(),
            limiter: Arc::new(ProviderLimiter::new(&limit, clock)),
        }
    }

    /// Serves `pages` pages of one candidate each, logging request times.
    struct PagedAdapter {
        name: String,
        pages: u32,
        clock: Arc<dyn Clock>,
        log: Arc<Mutex<Vec<(String, Duration)>>>,
    }

    impl SourceAdapter for PagedAdapter {
        fn provider(&self) -> &str {
            &self.name
        }

        fn fetch_page(&self, query: &str, page_token: Option<&str>) -> Result<Page, ProviderError> {
            self.log.lock().unwrap().push((self.name.clone(), self.clock.now()));
            let page: u32 = page_token.map_or(1, |t| t.parse().unwrap());
            Ok(Page {
                candidates: vec![candidate(&self.name, &format!("{}-{}-{}", self.name, query, page), "https://cdn.test/x")],
                next_page_token: (page < self.pages).then(|| (page + 1).to_string()),
            })
        }
    }

    /// Takes `latency` of wall time per page and records when its last page was served.
    struct LaggingAdapter {
        name: String,
        pages: u32,
        latency: Duration,
        finished_at: Mutex<Option<Instant>>,
    }

    impl SourceAdapter for LaggingAdapter {
        fn provider(&self) -> &str {
            &self.name
        }

        fn fetch_page(&self, _query: &str, page_token: Option<&str>) -> Result<Page, ProviderError> {
            std::thread::sleep(self.latency);
            let page: u32 = page_token.map_or(1, |t| t.parse().unwrap());
            if page == self.pages {
                *self.finished_at.lock().unwrap() = Some(Instant::now());
            }
            Ok(Page {
                candidates: vec![candidate(&self.name, &page.to_string(), "https://cdn.test/x")],
                next_page_token: (page < self.pages).then(|| (page + 1).to_string()),
            })
        }
    }

    #[test]
    fn test_rate_limit_conformance() {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(PagedAdapter {
            name: "pixabay".to_string(),
            pages: 60,
            clock: clock.clone(),
            log: log.clone(),
        });

        let coordinator = FetchCoordinator::new(
            vec![plan(adapter, &["guitar"], clock.clone(), 4.0, 2)],
            retry(),
            clock.clone(),
            1000,
            3,
        );
        let report = coordinator.run(&RunCounters::new(), &AtomicBool::new(false), |_| true);
        assert_eq!(report.pages_ok, 60);

        let times: Vec<Duration> = log.lock().unwrap().iter().map(|(_, t)| *t).collect();
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..].iter().take_while(|t| **t < *start + Duration::from_secs(1)).count();
            assert!(in_window <= 4 + 2, "{} requests in window at {:?}", in_window, start);
        }
        // steady state is the configured rate, not slower
        assert!(clock.now() <= Duration::from_secs(16));
    }

    #[test]
    fn test_each_provider_emits_in_page_order() {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = |name: &str| -> Arc<dyn SourceAdapter> {
            Arc::new(PagedAdapter {
                name: name.to_string(),
                pages: 3,
                clock: clock.clone(),
                log: log.clone(),
            })
        };

        let coordinator = FetchCoordinator::new(
            vec![
                plan(make("pixabay"), &["guitar"], clock.clone(), 100.0, 10),
                plan(make("pexels"), &["guitar"], clock.clone(), 100.0, 10),
            ],
            retry(),
            clock.clone(),
            100,
            3,
        );
        let emitted = Mutex::new(Vec::new());
        let report = coordinator.run(&RunCounters::new(), &AtomicBool::new(false), |c| {
            emitted.lock().unwrap().push(c.provider_native_id);
            true
        });
        assert_eq!(report.pages_ok, 6);
        assert_eq!(report.candidates, 6);

        let emitted = emitted.into_inner().unwrap();
        for provider in ["pixabay", "pexels"] {
            let ids: Vec<&String> = emitted.iter().filter(|id| id.starts_with(provider)).collect();
            let expected: Vec<String> = (1..=3).map(|p| format!("{}-guitar-{}", provider, p)).collect();
            assert_eq!(ids, expected.iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_slow_provider_does_not_pace_others() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let slow = Arc::new(LaggingAdapter {
            name: "slow".to_string(),
            pages: 4,
            latency: Duration::from_millis(500),
            finished_at: Mutex::new(None),
        });
        let fast = Arc::new(LaggingAdapter {
            name: "fast".to_string(),
            pages: 4,
            latency: Duration::from_millis(1),
            finished_at: Mutex::new(None),
        });

        let coordinator = FetchCoordinator::new(
            vec![
                plan(slow.clone(), &["guitar"], clock.clone(), 100.0, 10),
                plan(fast.clone(), &["guitar"], clock.clone(), 100.0, 10),
            ],
            retry(),
            clock,
            100,
            3,
        );
        let started = Instant::now();
        let report = coordinator.run(&RunCounters::new(), &AtomicBool::new(false), |_| true);
        assert_eq!(report.pages_ok, 8);

        let fast_done = fast.finished_at.lock().unwrap().unwrap() - started;
        let slow_done = slow.finished_at.lock().unwrap().unwrap() - started;
        assert!(fast_done < Duration::from_millis(500), "fast provider finished after {:?}", fast_done);
        assert!(slow_done >= Duration::from_secs(2));
    }

    #[test]
    fn test_retries_then_skips_failed_page() {
        let clock = Arc::new(ManualClock::new());
        let adapter = Arc::new(ScriptedAdapter::new("pixabay"));
        adapter.push_page("guitar", None, Err(ProviderError::from_status("pixabay", 503, "busy")));
        adapter.push_page(
            "guitar",
            None,
            Ok(Page {
                candidates: vec![candidate("pixabay", "1", "https://cdn.test/1")],
                next_page_token: Some("2".to_string()),
            }),
        );
        adapter.push_page("guitar", Some("2"), Err(ProviderError::from_status("pixabay", 400, "bad")));
        adapter.push_page(
            "guitar",
            Some("3"),
            Ok(Page {
                candidates: vec![candidate("pixabay", "3", "https://cdn.test/3")],
                next_page_token: None,
            }),
        );

        let counters = RunCounters::new();
        let coordinator = FetchCoordinator::new(
            vec![plan(adapter.clone(), &["guitar"], clock.clone(), 100.0, 10)],
            retry(),
            clock.clone(),
            100,
            3,
        );
        let ids = Mutex::new(Vec::new());
        let report = coordinator.run(&counters, &AtomicBool::new(false), |c| {
            ids.lock().unwrap().push(c.provider_native_id);
            true
        });

        assert_eq!(ids.into_inner().unwrap(), vec!["1", "3"]);
        assert_eq!(report.pages_ok, 2);
        assert_eq!(report.pages_failed, 1);
        assert_eq!(counters.snapshot().rejected_error, 1);
        assert!(clock.now() >= Duration::from_millis(200));

        let calls: Vec<Option<String>> = adapter.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(calls, vec![None, None, Some("2".to_string()), Some("3".to_string())]);
    }

    #[test]
    fn test_exhausted_retries_and_abandoned_query() {
        let clock = Arc::new(ManualClock::new());
        let adapter = Arc::new(ScriptedAdapter::new("pexels"));
        for token in [None, Some("2"), Some("3"), Some("4")] {
            adapter.push_page("guitar", token, Err(ProviderError::transport("pexels", "unreachable")));
        }

        let counters = RunCounters::new();
        let coordinator = FetchCoordinator::new(
            vec![plan(adapter.clone(), &["guitar"], clock.clone(), 100.0, 10)],
            retry(),
            clock.clone(),
            100,
            3,
        );
        let report = coordinator.run(&counters, &AtomicBool::new(false), |_| true);

        // three pages, each tried max_attempts times, then the query is dropped
        assert_eq!(report.pages_failed, 3);
        assert!(report.all_unreachable());
        assert_eq!(adapter.calls().len(), 9);
        assert_eq!(counters.snapshot().rejected_error, 3);
    }

    #[test]
    fn test_max_results_caps_query() {
        let clock = Arc::new(ManualClock::new());
        let candidates = (0..5)
            .map(|i| candidate("unsplash", &i.to_string(), "https://cdn.test/u"))
            .collect();
        let adapter = Arc::new(ScriptedAdapter::new("unsplash"));
        adapter.push_page(
            "guitar",
            None,
            Ok(Page {
                candidates,
                next_page_token: Some("2".to_string()),
            }),
        );

        let coordinator = FetchCoordinator::new(
            vec![plan(adapter.clone(), &["guitar", "ukulele"], clock.clone(), 100.0, 10)],
            retry(),
            clock.clone(),
            3,
            3,
        );
        let report = coordinator.run(&RunCounters::new(), &AtomicBool::new(false), |_| true);

        assert_eq!(report.candidates, 3);
        let queries: Vec<String> = adapter.calls().into_iter().map(|(q, _)| q).collect();
        assert_eq!(queries, vec!["guitar", "ukulele"]);
    }

    #[test]
    fn test_cancel_stops_new_requests() {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(PagedAdapter {
            name: "pixabay".to_string(),
            pages: 100,
            clock: clock.clone(),
            log: log.clone(),
        });
        let cancel = AtomicBool::new(false);

        let coordinator = FetchCoordinator::new(
            vec![plan(adapter, &["guitar"], clock.clone(), 100.0, 10)],
            retry(),
            clock.clone(),
            1000,
            3,
        );
        let seen = AtomicUsize::new(0);
        coordinator.run(&RunCounters::new(), &cancel, |_| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                cancel.store(true, Ordering::SeqCst);
            }
            true
        });

        assert_eq!(log.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_closed_sink_stops_every_provider() {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = |name: &str| -> Arc<dyn SourceAdapter> {
            Arc::new(PagedAdapter {
                name: name.to_string(),
                pages: 1000,
                clock: clock.clone(),
                log: log.clone(),
            })
        };

        let coordinator = FetchCoordinator::new(
            vec![
                plan(make("pixabay"), &["guitar"], clock.clone(), 1000.0, 10),
                plan(make("pexels"), &["guitar"], clock.clone(), 1000.0, 10),
            ],
            retry(),
            clock.clone(),
            10_000,
            3,
        );
        coordinator.run(&RunCounters::new(), &AtomicBool::new(false), |_| false);

        // each worker stops at its first refused candidate, or sees the other's refusal
        assert!(log.lock().unwrap().len() <= 2);
    }
}

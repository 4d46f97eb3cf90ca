//! Paginated source extraction with bounded retries
//!
//! Every government source exposes the same abstract shape: a paginated
//! endpoint accepting a page index, a page size and a date range, returning
//! `{content: [...], totalElements}`. Extraction walks the pages in order
//! and yields them as a lazy, finite stream. The stream is not restartable
//! mid-flight; a re-run starts from page zero and relies on the dedup
//! constraint downstream.
//!
//! Failure handling follows the error taxonomy:
//! - transient failures (timeout, 5xx) are retried with exponential backoff
//!   and jitter up to a bounded attempt count, then escalated
//! - permanent failures (4xx, malformed body) terminate the stream
//!   immediately; pages already yielded stay yielded

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::Stream;
use grantflow_schemas::SourcePage;
use rand::Rng;
use tracing::{debug, instrument, warn};
use url::Url;

mod registry;

pub use registry::{EntitySpec, Prerequisite, SourceKind, SourceRegistry};

/// Classification of a single page-fetch failure
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Worth retrying: timeout, connection problem, 5xx
    #[error("transient source failure: {0}")]
    Transient(String),
    /// Not worth retrying: 4xx, malformed response
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

/// Errors surfaced by the extraction stream
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Transient failures exhausted the retry budget
    #[error("page {page} still failing after {attempts} attempts: {message}")]
    RetriesExhausted {
        page: u64,
        attempts: u32,
        message: String,
    },
    /// The source answered with a non-retryable error
    #[error("page {page} failed permanently: {message}")]
    Permanent { page: u64, message: String },
}

impl ExtractError {
    /// Page index the failure occurred on
    pub fn page(&self) -> u64 {
        match self {
            ExtractError::RetriesExhausted { page, .. } => *page,
            ExtractError::Permanent { page, .. } => *page,
        }
    }

    /// A failure on page zero means no partial result exists for the source
    pub fn is_first_page(&self) -> bool {
        self.page() == 0
    }
}

/// One page request against a source
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub endpoint: Url,
    pub page: u64,
    pub page_size: usize,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// Seam between the pagination loop and the actual transport.
///
/// The HTTP implementation lives in [`HttpPageFetcher`]; tests script pages
/// through stub implementations.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, FetchError>;
}

/// Retry policy for transient page failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per page, first try included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with random jitter: base * 2^(attempt-1) + jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base_delay.as_millis() as u64);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Parameters of one extraction pass over a source
#[derive(Debug, Clone)]
pub struct ExtractQuery {
    pub endpoint: Url,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub page_size: usize,
}

/// One extracted page together with its position in the pass
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// Zero-based page index, in source order
    pub page_index: u64,
    /// Records of this page, ids already deduplicated within the pass
    pub records: Vec<serde_json::Value>,
    /// Expected page count derived from the source-reported total, known
    /// after the first page
    pub expected_pages: u64,
}

struct PassState {
    page: u64,
    yielded: u64,
    seen_ids: HashSet<String>,
    done: bool,
}

/// Walk the pages of one source as a lazy stream
///
/// Terminates when a page comes back shorter than the page size or the
/// cumulative record count reaches the source-reported total. Records whose
/// id was already seen within this pass are dropped with a warning.
pub fn extract_pages(
    fetcher: Arc<dyn PageFetcher>,
    mut query: ExtractQuery,
    retry: RetryPolicy,
) -> impl Stream<Item = Result<ExtractedPage, ExtractError>> {
    query.page_size = query.page_size.max(1);
    let state = PassState {
        page: 0,
        yielded: 0,
        seen_ids: HashSet::new(),
        done: false,
    };

    futures::stream::try_unfold(state, move |mut state| {
        let fetcher = fetcher.clone();
        let query = query.clone();
        let retry = retry.clone();

        async move {
            if state.done {
                return Ok(None);
            }

            let request = PageRequest {
                endpoint: query.endpoint.clone(),
                page: state.page,
                page_size: query.page_size,
                date_from: query.date_from,
                date_to: query.date_to,
            };

            let page = fetch_with_retry(fetcher.as_ref(), &request, &retry).await?;
            let raw_len = page.content.len() as u64;
            state.yielded += raw_len;

            // termination: short page, or source-reported total reached
            if page.content.len() < query.page_size
                || (page.total_elements > 0 && state.yielded >= page.total_elements)
            {
                state.done = true;
            }

            let expected_pages = if page.total_elements == 0 {
                state.page + 1
            } else {
                page.total_elements.div_ceil(query.page_size as u64)
            };

            let mut records = Vec::with_capacity(page.content.len());
            for record in page.content {
                match record_id(&record) {
                    Some(id) if !state.seen_ids.insert(id.clone()) => {
                        warn!(source_id = %id, page = state.page, "Duplicate record id within extraction, skipping");
                    }
                    _ => records.push(record),
                }
            }

            debug!(
                page = state.page,
                records = records.len(),
                expected_pages,
                "Extracted page"
            );

            let extracted = ExtractedPage {
                page_index: state.page,
                records,
                expected_pages,
            };
            state.page += 1;

            Ok(Some((extracted, state)))
        }
    })
}

async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    request: &PageRequest,
    retry: &RetryPolicy,
) -> Result<SourcePage, ExtractError> {
    let mut attempt = 1;

    loop {
        match fetcher.fetch_page(request).await {
            Ok(page) => return Ok(page),
            Err(FetchError::Permanent(message)) => {
                return Err(ExtractError::Permanent {
                    page: request.page,
                    message,
                });
            }
            Err(FetchError::Transient(message)) => {
                if attempt >= retry.max_attempts {
                    return Err(ExtractError::RetriesExhausted {
                        page: request.page,
                        attempts: attempt,
                        message,
                    });
                }

                let delay = retry.backoff(attempt);
                warn!(
                    page = request.page,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transient page failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn record_id(record: &serde_json::Value) -> Option<String> {
    match record.get("id") {
        Some(serde_json::Value::String(id)) => Some(id.clone()),
        Some(serde_json::Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// HTTP implementation of [`PageFetcher`] backed by reqwest
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    /// Build a fetcher with the given per-request timeout. Page sizes run
    /// into the thousands, so timeouts are on the order of minutes.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Permanent(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(skip(self), fields(endpoint = %request.endpoint, page = request.page))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, FetchError> {
        let response = self
            .client
            .get(request.endpoint.clone())
            .query(&[
                ("page", request.page.to_string()),
                ("pageSize", request.page_size.to_string()),
                ("dateFrom", request.date_from.to_string()),
                ("dateTo", request.date_to.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchError::Transient(e.to_string())
                } else {
                    FetchError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchError::Transient(format!("source answered {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("source answered {status}")));
        }

        response
            .json::<SourcePage>()
            .await
            .map_err(|e| FetchError::Permanent(format!("malformed page body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn query(page_size: usize) -> ExtractQuery {
        ExtractQuery {
            endpoint: Url::parse("https://sources.test/grants/search").unwrap(),
            date_from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            page_size,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    /// Scripted fetcher: pops one response per request
    struct ScriptedFetcher {
        responses: Mutex<Vec<Result<SourcePage, FetchError>>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<SourcePage, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, _request: &PageRequest) -> Result<SourcePage, FetchError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(FetchError::Permanent("script exhausted".into()));
            }
            responses.remove(0)
        }
    }

    fn page_of(ids: &[u64], total: u64) -> SourcePage {
        SourcePage {
            content: ids.iter().map(|id| json!({"id": id})).collect(),
            total_elements: total,
        }
    }

    #[tokio::test]
    async fn short_page_terminates_the_stream() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page_of(&[1, 2], 3)),
            Ok(page_of(&[3], 3)),
            Ok(page_of(&[99], 99)), // must never be requested
        ]);

        let pages: Vec<_> = extract_pages(fetcher, query(2), fast_retry())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(pages.len(), 2);
        let last = pages[1].as_ref().unwrap();
        assert_eq!(last.page_index, 1);
        assert_eq!(last.records.len(), 1);
    }

    #[tokio::test]
    async fn total_elements_terminates_full_last_page() {
        // two full pages of 2 exactly reach the reported total of 4
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page_of(&[1, 2], 4)),
            Ok(page_of(&[3, 4], 4)),
            Ok(page_of(&[99], 99)),
        ]);

        let pages: Vec<_> = extract_pages(fetcher, query(2), fast_retry())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.is_ok()));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("timeout".into())),
            Ok(page_of(&[1], 1)),
        ]);

        let pages: Vec<_> = extract_pages(fetcher, query(10), fast_retry())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].as_ref().unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("503".into())),
            Ok(page_of(&[1], 1)), // out of budget, never reached
        ]);

        let pages: Vec<_> = extract_pages(fetcher, query(10), fast_retry())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(pages.len(), 1);
        let error = pages[0].as_ref().unwrap_err();
        assert!(matches!(
            error,
            ExtractError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(error.is_first_page());
    }

    #[tokio::test]
    async fn permanent_failure_preserves_earlier_pages() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page_of(&[1, 2], 10)),
            Err(FetchError::Permanent("404".into())),
        ]);

        let pages: Vec<_> = extract_pages(fetcher, query(2), fast_retry())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(pages.len(), 2);
        assert!(pages[0].is_ok());
        let error = pages[1].as_ref().unwrap_err();
        assert!(matches!(error, ExtractError::Permanent { page: 1, .. }));
        assert!(!error.is_first_page());
    }

    #[tokio::test]
    #[traced_test]
    async fn duplicate_ids_within_a_pass_are_dropped() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page_of(&[1, 2], 4)),
            Ok(page_of(&[2, 3], 4)),
        ]);

        let pages: Vec<_> = extract_pages(fetcher, query(2), fast_retry())
            .collect::<Vec<_>>()
            .await;

        let second = pages[1].as_ref().unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0]["id"], 3);
        assert!(logs_contain("Duplicate record id"));
    }

    #[tokio::test]
    async fn expected_pages_follows_reported_total() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page_of(&[1], 5))]);

        let pages: Vec<_> = extract_pages(fetcher, query(2), fast_retry())
            .collect::<Vec<_>>()
            .await;

        // 5 elements at page size 2 -> 3 expected pages
        assert_eq!(pages[0].as_ref().unwrap().expected_pages, 3);
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };

        let first = policy.backoff(1);
        let third = policy.backoff(3);
        assert!(first >= Duration::from_millis(100));
        // cap plus at most one base_delay of jitter
        assert!(third <= Duration::from_millis(400));
    }
}

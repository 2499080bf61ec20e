//! One-shot icon fetching
//!
//! This module provides a trait-based abstraction for downloading icon
//! candidates, so the cache core stays agnostic about transport. The
//! default [`HttpIconFetcher`] rides on `ureq` with cookies and any form
//! of user interaction disabled; tests and embedders substitute their own
//! [`UrlFetcher`].
//!
//! A fetch is a one-shot job: [`IconFetchJob::start`] hands the request to
//! a detached worker thread and the single terminal outcome comes back
//! over a channel. All cache state stays on the caller's thread — only the
//! fetched bytes cross. Dropping a job before completion cancels it; the
//! worker's send lands on a dead channel and the result is discarded.

use crate::error::FetchError;
use log::debug;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use url::Url;

/// Default User-Agent string for icon requests
pub const DEFAULT_USER_AGENT: &str =
  "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36 fasticon/0.1";

const MAX_REDIRECTS: usize = 10;

/// Parameters of one icon fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  /// The candidate icon URL to download.
  pub icon_url: String,
  /// The document the icon belongs to; sent as the referrer.
  pub document_url: String,
  /// Opaque isolation context id, forwarded to custom fetchers.
  pub context_id: u64,
  /// Bypass intermediary caches (`Cache-Control: no-cache`).
  pub reload: bool,
}

/// Result of a successful icon download.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
  pub bytes: Vec<u8>,
  /// Declared `Content-Type` header value, if any.
  pub content_type: Option<String>,
}

/// Terminal outcome of an [`IconFetchJob`], reported exactly once.
#[derive(Debug)]
pub enum FetchOutcome {
  Loaded(FetchedPayload),
  Failed(FetchError),
}

/// Trait for downloading icon candidates
///
/// Implementations must be `Send + Sync`; the fetch itself runs on a
/// worker thread.
pub trait UrlFetcher: Send + Sync {
  fn fetch(&self, request: &FetchRequest) -> Result<FetchedPayload, FetchError>;
}

// Allow Arc<dyn UrlFetcher> to be used as UrlFetcher
impl<T: UrlFetcher + ?Sized> UrlFetcher for Arc<T> {
  fn fetch(&self, request: &FetchRequest) -> Result<FetchedPayload, FetchError> {
    (**self).fetch(request)
  }
}

/// Default HTTP icon fetcher
///
/// Issues a plain GET with a global timeout, a size cap and no cookie
/// store. Responses that redirect are followed up to a hop limit.
#[derive(Debug, Clone)]
pub struct HttpIconFetcher {
  timeout: Duration,
  user_agent: String,
  max_size: usize,
}

impl HttpIconFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the request timeout
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Set the User-Agent header
  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = user_agent.into();
    self
  }

  /// Set the maximum response size in bytes
  pub fn with_max_size(mut self, max_size: usize) -> Self {
    self.max_size = max_size;
    self
  }
}

impl Default for HttpIconFetcher {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      user_agent: DEFAULT_USER_AGENT.to_string(),
      // Icons are tiny; anything bigger than this is not one.
      max_size: 1024 * 1024,
    }
  }
}

impl UrlFetcher for HttpIconFetcher {
  fn fetch(&self, request: &FetchRequest) -> Result<FetchedPayload, FetchError> {
    if request.icon_url.is_empty() {
      return Err(FetchError::EmptyUrl);
    }
    let config = ureq::Agent::config_builder()
      .timeout_global(Some(self.timeout))
      .build();
    let agent: ureq::Agent = config.into();

    let mut current = request.icon_url.clone();
    for _ in 0..MAX_REDIRECTS {
      let mut get = agent
        .get(&current)
        .header("User-Agent", &self.user_agent)
        .header("Referer", &request.document_url);
      if request.reload {
        get = get.header("Cache-Control", "no-cache");
      }

      let mut response = get.call().map_err(|err| FetchError::Http {
        url: current.clone(),
        reason: err.to_string(),
      })?;

      let status = response.status();
      if (300..400).contains(&status.as_u16()) {
        if let Some(loc) = response
          .headers()
          .get("location")
          .and_then(|h| h.to_str().ok())
        {
          current = Url::parse(&current)
            .ok()
            .and_then(|base| base.join(loc).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| loc.to_string());
          continue;
        }
      }

      let content_type = response
        .headers()
        .get("content-type")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

      let bytes = response
        .body_mut()
        .with_config()
        .limit(self.max_size as u64)
        .read_to_vec()
        .map_err(|err| match err {
          ureq::Error::BodyExceedsLimit(_) => FetchError::TooLarge {
            url: current.clone(),
            limit: self.max_size,
          },
          other => FetchError::Http {
            url: current.clone(),
            reason: other.to_string(),
          },
        })?;

      if bytes.is_empty() {
        return Err(FetchError::Http {
          url: current,
          reason: "empty response body".to_string(),
        });
      }
      return Ok(FetchedPayload {
        bytes,
        content_type,
      });
    }

    Err(FetchError::TooManyRedirects {
      url: request.icon_url.clone(),
    })
  }
}

/// One in-flight icon fetch.
///
/// Created by [`IconFetchJob::start`]; lives in the manager's job list
/// until an idle sweep reaps it after the terminal outcome is taken.
pub struct IconFetchJob {
  request: FetchRequest,
  outcome_rx: Receiver<FetchOutcome>,
  completed: bool,
}

impl IconFetchJob {
  /// Start fetching `request.icon_url` on a worker thread.
  ///
  /// Returns `None` without starting anything when either URL is empty or
  /// the worker cannot be spawned.
  pub fn start(fetcher: Arc<dyn UrlFetcher>, request: FetchRequest) -> Option<Self> {
    if request.icon_url.is_empty() || request.document_url.is_empty() {
      debug!("icon fetch not started: empty URL");
      return None;
    }
    let (outcome_tx, outcome_rx) = mpsc::channel();
    let worker_request = request.clone();
    let spawned = thread::Builder::new()
      .name("fasticon-fetch".to_string())
      .spawn(move || {
        let outcome = match fetcher.fetch(&worker_request) {
          Ok(payload) => FetchOutcome::Loaded(payload),
          Err(err) => FetchOutcome::Failed(err),
        };
        // A dead channel means the job was dropped (cancelled).
        let _ = outcome_tx.send(outcome);
      });
    if spawned.is_err() {
      debug!("icon fetch not started: worker spawn failed");
      return None;
    }
    Some(Self {
      request,
      outcome_rx,
      completed: false,
    })
  }

  pub fn request(&self) -> &FetchRequest {
    &self.request
  }

  /// Live status: true until the terminal outcome has been taken.
  pub fn is_loading(&self) -> bool {
    !self.completed
  }

  /// Whether the terminal outcome has been taken; finished jobs are ready
  /// to be reaped.
  pub fn is_finished(&self) -> bool {
    self.completed
  }

  /// Non-blocking poll for the terminal outcome.
  ///
  /// Returns the outcome exactly once; after that (and before completion)
  /// it returns `None`. A worker that died without reporting surfaces as
  /// [`FetchError::Interrupted`].
  pub fn try_complete(&mut self) -> Option<FetchOutcome> {
    if self.completed {
      return None;
    }
    match self.outcome_rx.try_recv() {
      Ok(outcome) => {
        self.completed = true;
        Some(outcome)
      }
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Disconnected) => {
        self.completed = true;
        Some(FetchOutcome::Failed(FetchError::Interrupted))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{Read, Write};
  use std::net::TcpListener;
  use std::sync::Mutex;
  use std::time::Instant;

  struct StaticFetcher {
    payload: FetchedPayload,
    delay: Duration,
  }

  impl UrlFetcher for StaticFetcher {
    fn fetch(&self, _request: &FetchRequest) -> Result<FetchedPayload, FetchError> {
      thread::sleep(self.delay);
      Ok(self.payload.clone())
    }
  }

  fn request(icon_url: &str, document_url: &str) -> FetchRequest {
    FetchRequest {
      icon_url: icon_url.to_string(),
      document_url: document_url.to_string(),
      context_id: 0,
      reload: false,
    }
  }

  fn wait_for_outcome(job: &mut IconFetchJob) -> FetchOutcome {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
      if let Some(outcome) = job.try_complete() {
        return outcome;
      }
      assert!(Instant::now() < deadline, "fetch job never completed");
      thread::sleep(Duration::from_millis(5));
    }
  }

  #[test]
  fn empty_urls_never_start_a_job() {
    let fetcher: Arc<dyn UrlFetcher> = Arc::new(StaticFetcher {
      payload: FetchedPayload {
        bytes: vec![1],
        content_type: None,
      },
      delay: Duration::ZERO,
    });
    assert!(IconFetchJob::start(Arc::clone(&fetcher), request("", "http://a.com/")).is_none());
    assert!(IconFetchJob::start(fetcher, request("http://a.com/favicon.ico", "")).is_none());
  }

  #[test]
  fn job_reports_its_terminal_outcome_exactly_once() {
    let fetcher: Arc<dyn UrlFetcher> = Arc::new(StaticFetcher {
      payload: FetchedPayload {
        bytes: b"icon bytes".to_vec(),
        content_type: Some("image/png".to_string()),
      },
      delay: Duration::from_millis(20),
    });
    let mut job =
      IconFetchJob::start(fetcher, request("http://a.com/favicon.ico", "http://a.com/"))
        .expect("job starts");
    assert!(job.is_loading());

    match wait_for_outcome(&mut job) {
      FetchOutcome::Loaded(payload) => assert_eq!(payload.bytes, b"icon bytes"),
      FetchOutcome::Failed(err) => panic!("unexpected failure: {err}"),
    }
    assert!(job.is_finished());
    assert!(!job.is_loading());
    assert!(job.try_complete().is_none());
  }

  #[test]
  fn fetch_failure_is_a_terminal_outcome_too() {
    struct FailingFetcher;
    impl UrlFetcher for FailingFetcher {
      fn fetch(&self, request: &FetchRequest) -> Result<FetchedPayload, FetchError> {
        Err(FetchError::Http {
          url: request.icon_url.clone(),
          reason: "connection refused".to_string(),
        })
      }
    }
    let mut job = IconFetchJob::start(
      Arc::new(FailingFetcher),
      request("http://a.com/favicon.ico", "http://a.com/"),
    )
    .expect("job starts");
    assert!(matches!(
      wait_for_outcome(&mut job),
      FetchOutcome::Failed(FetchError::Http { .. })
    ));
  }

  #[test]
  fn http_fetcher_downloads_bytes_and_content_type() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind icon server");
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(String::new()));
    let captured_req = Arc::clone(&captured);
    let handle = thread::spawn(move || {
      if let Some(stream) = listener.incoming().next() {
        let mut stream = stream.unwrap();
        let mut buf = [0u8; 2048];
        let _ = stream.read(&mut buf);
        if let Ok(mut slot) = captured_req.lock() {
          *slot = String::from_utf8_lossy(&buf).to_string();
        }

        let body = b"fake png bytes";
        let headers = format!(
          "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\n\r\n",
          body.len()
        );
        let _ = stream.write_all(headers.as_bytes());
        let _ = stream.write_all(body);
      }
    });

    let fetcher = HttpIconFetcher::new().with_timeout(Duration::from_secs(5));
    let mut req = request(
      &format!("http://{addr}/favicon.ico"),
      &format!("http://{addr}/page"),
    );
    req.reload = true;
    let payload = fetcher.fetch(&req).expect("fetch icon");
    handle.join().unwrap();

    assert_eq!(payload.bytes, b"fake png bytes");
    assert_eq!(payload.content_type.as_deref(), Some("image/png"));

    let seen = captured.lock().unwrap().to_lowercase();
    assert!(seen.contains("referer:"), "missing referrer: {seen}");
    assert!(
      seen.contains("cache-control: no-cache"),
      "missing reload header: {seen}"
    );
  }

  #[test]
  fn http_fetcher_refuses_an_empty_icon_url() {
    let fetcher = HttpIconFetcher::new();
    assert!(matches!(
      fetcher.fetch(&request("", "http://a.com/")),
      Err(FetchError::EmptyUrl)
    ));
  }

  #[test]
  fn http_fetcher_builder_applies_settings() {
    let fetcher = HttpIconFetcher::new()
      .with_timeout(Duration::from_secs(60))
      .with_user_agent("Test/1.0")
      .with_max_size(2048);
    assert_eq!(fetcher.timeout, Duration::from_secs(60));
    assert_eq!(fetcher.user_agent, "Test/1.0");
    assert_eq!(fetcher.max_size, 2048);
  }
}

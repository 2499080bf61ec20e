//! Favicon cache orchestration
//!
//! [`FavIconManager`] owns the shared bitmap cache, the per-host indexes,
//! the persistent allowlist and the in-flight fetch jobs, and wires them
//! together behind the four operations embedders call: add icon bytes,
//! add an icon by URL, look an icon up, and erase everything.
//!
//! The manager is single-threaded and event-driven: every mutating entry
//! point runs on one logical thread, network fetches complete on worker
//! threads but surface only through [`FavIconManager::process_pending`],
//! and no operation blocks its caller. Per-item failures degrade to "no
//! icon for this URL" without aborting anything else in progress.

use crate::allowlist::{PersistentAllowlist, ALLOWLIST_FILE};
use crate::bitmap;
use crate::error::Result;
use crate::fetch::{
  FetchOutcome, FetchRequest, FetchedPayload, HttpIconFetcher, IconFetchJob, UrlFetcher,
};
use crate::index::{escape_icon_url, IconIndex, INDEX_EXT};
use crate::shared_cache::{ImageHandle, SharedImageCache};
use image::RgbaImage;
use log::{debug, warn};
use rustc_hash::FxHashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

/// Image name requested from the placeholder provider on a total miss.
pub const PLACEHOLDER_DOCUMENT: &str = "document";

/// Observer of cache mutations. All methods default to no-ops so
/// listeners implement only what they care about.
pub trait FavIconListener {
  /// An icon for `document_url` was stored or updated on disk.
  fn on_icon_added(&self, _document_url: &str, _icon_path: &Path) {}
  /// The last outstanding fetch job finished.
  fn on_fetch_batch_finished(&self) {}
  /// A full erase completed.
  fn on_all_icons_removed(&self) {}
}

/// Source of generic fallback images (e.g. a per-document-type icon from
/// the embedder's skin).
pub trait PlaceholderProvider {
  fn named_image(&self, name: &str) -> Option<Rc<RgbaImage>>;
}

/// Result of a [`FavIconManager::lookup`].
pub enum Icon {
  /// A real cached icon, shared and reference-counted.
  Cached(ImageHandle),
  /// The embedder's generic fallback image.
  Placeholder(Rc<RgbaImage>),
  /// Nothing known and no placeholder configured.
  Missing,
}

impl Icon {
  pub fn is_missing(&self) -> bool {
    matches!(self, Icon::Missing)
  }

  /// The bitmap behind this icon, if there is one.
  pub fn bitmap(&self) -> Option<Rc<RgbaImage>> {
    match self {
      Icon::Cached(handle) => Some(handle.bitmap()),
      Icon::Placeholder(image) => Some(Rc::clone(image)),
      Icon::Missing => None,
    }
  }
}

/// Embedder-facing diagnostics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaviconStats {
  pub resident_images: usize,
  pub loaded_indexes: usize,
  pub pending_fetches: usize,
}

struct PendingFetch {
  job: IconFetchJob,
  on_demand: bool,
}

/// The favicon cache.
pub struct FavIconManager {
  icon_dir: PathBuf,
  images: SharedImageCache,
  index: IconIndex,
  allowlist: PersistentAllowlist,
  fetcher: Arc<dyn UrlFetcher>,
  jobs: Vec<PendingFetch>,
  listeners: Vec<Box<dyn FavIconListener>>,
  placeholders: Option<Box<dyn PlaceholderProvider>>,
}

impl FavIconManager {
  /// Create a manager storing icons and indexes under `icon_dir`.
  ///
  /// The directory is created if missing; failure to create it is
  /// absorbed, and every subsequent operation then degrades to "no icon".
  pub fn new(icon_dir: impl Into<PathBuf>) -> Self {
    let icon_dir = icon_dir.into();
    if let Err(err) = fs::create_dir_all(&icon_dir) {
      warn!(
        "failed to create icon cache dir {}: {err}",
        icon_dir.display()
      );
    }
    Self::with_dir(icon_dir)
  }

  /// Like [`new`](FavIconManager::new), but propagates a failure to create
  /// the cache directory instead of absorbing it.
  pub fn try_new(icon_dir: impl Into<PathBuf>) -> Result<Self> {
    let icon_dir = icon_dir.into();
    fs::create_dir_all(&icon_dir)?;
    Ok(Self::with_dir(icon_dir))
  }

  fn with_dir(icon_dir: PathBuf) -> Self {
    Self {
      images: SharedImageCache::new(&icon_dir),
      index: IconIndex::new(&icon_dir),
      allowlist: PersistentAllowlist::new(&icon_dir),
      fetcher: Arc::new(HttpIconFetcher::new()),
      jobs: Vec::new(),
      listeners: Vec::new(),
      placeholders: None,
      icon_dir,
    }
  }

  /// Replace the transport used for icon downloads.
  pub fn with_fetcher(mut self, fetcher: Arc<dyn UrlFetcher>) -> Self {
    self.fetcher = fetcher;
    self
  }

  /// Attach a provider of generic fallback images.
  pub fn with_placeholders(mut self, placeholders: Box<dyn PlaceholderProvider>) -> Self {
    self.placeholders = Some(placeholders);
    self
  }

  pub fn add_listener(&mut self, listener: Box<dyn FavIconListener>) {
    self.listeners.push(listener);
  }

  pub fn icon_dir(&self) -> &Path {
    &self.icon_dir
  }

  /// Store already-fetched icon bytes for a document URL.
  ///
  /// The payload must pass the image signature check; it is normalized to
  /// the canonical form and written under a filename derived from the
  /// document URL. Returns whether anything changed.
  pub fn add_bytes(&mut self, document_url: &str, bytes: &[u8]) -> bool {
    debug_assert!(!document_url.is_empty(), "add_bytes requires a document URL");
    if document_url.is_empty() || bytes.is_empty() {
      return false;
    }
    let normalized = match bitmap::validate_and_normalize(None, bytes) {
      Ok(normalized) => normalized,
      Err(err) => {
        debug!("rejected icon payload for {document_url}: {err}");
        return false;
      }
    };
    let filename = escape_icon_url(document_url);
    self.commit_icon(document_url, &filename, &normalized, false)
  }

  /// Start fetching an icon candidate for a document URL.
  ///
  /// Returns whether a job was started: empty URLs, a failed worker spawn
  /// and a duplicate in-flight fetch for the same icon URL all yield
  /// `false`. The outcome is applied on a later [`process_pending`] call;
  /// `on_demand` additionally records the icon in the persistent
  /// allowlist so it survives [`erase_all`].
  ///
  /// [`process_pending`]: FavIconManager::process_pending
  /// [`erase_all`]: FavIconManager::erase_all
  pub fn add_url(
    &mut self,
    document_url: &str,
    icon_url: &str,
    on_demand: bool,
    context_id: u64,
  ) -> bool {
    if self
      .jobs
      .iter()
      .any(|pending| pending.job.is_loading() && pending.job.request().icon_url == icon_url)
    {
      debug!("icon fetch already in flight for {icon_url}");
      return false;
    }
    let request = FetchRequest {
      icon_url: icon_url.to_string(),
      document_url: document_url.to_string(),
      context_id,
      reload: false,
    };
    match IconFetchJob::start(Arc::clone(&self.fetcher), request) {
      Some(job) => {
        self.jobs.push(PendingFetch { job, on_demand });
        true
      }
      None => false,
    }
  }

  /// The idle sweep: drain finished fetch jobs, apply their outcomes and
  /// reap the job objects. Fires `on_fetch_batch_finished` when the last
  /// outstanding job drains. Returns the number of outcomes processed.
  pub fn process_pending(&mut self) -> usize {
    let mut completions: Vec<(FetchRequest, bool, FetchOutcome)> = Vec::new();
    for pending in &mut self.jobs {
      if let Some(outcome) = pending.job.try_complete() {
        completions.push((pending.job.request().clone(), pending.on_demand, outcome));
      }
    }
    // Reap before applying outcomes so listener callbacks observe a
    // settled job list.
    self.jobs.retain(|pending| !pending.job.is_finished());

    let processed = completions.len();
    for (request, on_demand, outcome) in completions {
      match outcome {
        FetchOutcome::Loaded(payload) => self.apply_fetched(&request, on_demand, payload),
        // Network failure is terminal and silent: same as "no icon found".
        FetchOutcome::Failed(err) => {
          debug!("icon fetch for {} failed: {err}", request.icon_url);
        }
      }
    }

    if processed > 0 && self.jobs.is_empty() {
      self.notify(|listener| listener.on_fetch_batch_finished());
    }
    processed
  }

  /// Resolve a document URL to its icon.
  ///
  /// `refresh` forces a reload of the bitmap from disk even when it is
  /// resident. A resolved file that is not in canonical form (written by
  /// an older cache) is re-normalized in place and its mapping re-merged,
  /// which is idempotent. A total miss falls back to the placeholder
  /// provider.
  pub fn lookup(&mut self, document_url: &str, refresh: bool, allow_near_match: bool) -> Icon {
    if let Some(filename) = self.index.resolve(document_url, allow_near_match) {
      if !refresh && self.images.resident(&filename) {
        return Icon::Cached(self.images.acquire(&filename, document_url));
      }
      self.renormalize_legacy_file(document_url, &filename);
      if refresh {
        self.images.reload(&filename);
      }
      let handle = self.images.acquire(&filename, document_url);
      if !handle.is_empty() {
        return Icon::Cached(handle);
      }
      // Unreadable or undecodable file: treat as a miss.
    }
    if let Some(provider) = &self.placeholders {
      if let Some(image) = provider.named_image(PLACEHOLDER_DOCUMENT) {
        return Icon::Placeholder(image);
      }
    }
    Icon::Missing
  }

  /// Wipe the cache: every icon and index file is deleted except the
  /// allowlist file and the icons it protects, the in-memory caches are
  /// dropped, and the per-host indexes are rebuilt from the allowlist.
  /// Outstanding fetch jobs are cancelled.
  pub fn erase_all(&mut self) {
    self.jobs.clear();
    self.images.clear();
    self.index.forget_cached();

    let protected: FxHashSet<String> = self
      .allowlist
      .records()
      .iter()
      .map(|entry| entry.icon_filename.clone())
      .collect();

    match fs::read_dir(&self.icon_dir) {
      Ok(read_dir) => {
        for entry in read_dir.flatten() {
          let path = entry.path();
          if !path.is_file() {
            continue;
          }
          let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
          };
          if name == ALLOWLIST_FILE {
            continue;
          }
          let is_index = path.extension().and_then(|e| e.to_str()) == Some(INDEX_EXT);
          if !is_index && protected.contains(name) {
            continue;
          }
          if let Err(err) = fs::remove_file(&path) {
            warn!("failed to delete {}: {err}", path.display());
          }
        }
      }
      Err(err) => {
        warn!(
          "failed to scan icon cache dir {}: {err}",
          self.icon_dir.display()
        );
      }
    }

    self.allowlist.rebuild_indexes(&mut self.index);
    self.notify(|listener| listener.on_all_icons_removed());
  }

  /// Diagnostics snapshot.
  pub fn stats(&self) -> FaviconStats {
    FaviconStats {
      resident_images: self.images.len(),
      loaded_indexes: self.index.loaded_hosts(),
      pending_fetches: self.jobs.len(),
    }
  }

  fn apply_fetched(&mut self, request: &FetchRequest, on_demand: bool, payload: FetchedPayload) {
    let normalized =
      match bitmap::validate_and_normalize(payload.content_type.as_deref(), &payload.bytes) {
        Ok(normalized) => normalized,
        Err(err) => {
          debug!("rejected fetched icon {}: {err}", request.icon_url);
          return;
        }
      };
    let filename = escape_icon_url(&request.icon_url);
    self.commit_icon(&request.document_url, &filename, &normalized, on_demand);
  }

  /// Write a normalized icon to disk (skipping byte-identical rewrites),
  /// merge the index mapping, refresh resident bitmaps and notify.
  /// Returns whether anything changed.
  fn commit_icon(
    &mut self,
    document_url: &str,
    filename: &str,
    normalized: &[u8],
    on_demand: bool,
  ) -> bool {
    let path = self.icon_dir.join(filename);
    let identical = fs::read(&path).map_or(false, |current| current == normalized);
    if !identical {
      if let Err(err) = fs::write(&path, normalized) {
        warn!("failed to write icon file {}: {err}", path.display());
        return false;
      }
    }
    let rewritten = self.index.merge(document_url, filename);
    if on_demand {
      self.allowlist.remember(document_url, filename);
    }
    let changed = !identical || rewritten;
    if changed {
      self.images.reload(filename);
      self.notify(|listener| listener.on_icon_added(document_url, &path));
    }
    changed
  }

  fn renormalize_legacy_file(&mut self, document_url: &str, filename: &str) {
    let path = self.icon_dir.join(filename);
    let Ok(bytes) = fs::read(&path) else {
      return;
    };
    if bitmap::is_canonical(&bytes) {
      return;
    }
    let Ok(normalized) = bitmap::normalize(&bytes, None) else {
      return;
    };
    if let Err(err) = fs::write(&path, &normalized) {
      warn!("failed to rewrite legacy icon {}: {err}", path.display());
      return;
    }
    debug!("re-normalized legacy icon file {}", path.display());
    let _ = self.index.merge(document_url, filename);
    self.images.reload(filename);
  }

  fn notify(&self, f: impl Fn(&dyn FavIconListener)) {
    for listener in &self.listeners {
      f(listener.as_ref());
    }
  }
}

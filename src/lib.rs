//! # fasticon
//!
//! A durable favicon cache: per-host text indexes mapping document URLs
//! to locally stored icon files, a reference-counted in-memory cache of
//! decoded bitmaps, one-shot asynchronous icon fetching, and a persistent
//! allowlist of icons that survive a full cache wipe.
//!
//! Everything stored on disk is normalized to a canonical 16x16 PNG so
//! redundant writes can be skipped by byte comparison. The subsystem has
//! no user-facing error surface: per-item failures degrade to "no icon"
//! and lookups fall back to an embedder-provided placeholder.
//!
//! ```rust,ignore
//! use fasticon::FavIconManager;
//!
//! let mut manager = FavIconManager::new("/path/to/icon-cache");
//! manager.add_url("http://example.com/", "http://example.com/favicon.ico", false, 0);
//! // ... later, on the idle sweep:
//! manager.process_pending();
//! let icon = manager.lookup("http://example.com/", false, true);
//! ```

pub mod allowlist;
pub mod bitmap;
pub mod error;
pub mod fetch;
pub mod index;
pub mod manager;
pub mod shared_cache;

pub use allowlist::{PersistentAllowlist, PersistentEntry, ALLOWLIST_FILE};
pub use bitmap::ICON_EDGE;
pub use error::{Error, FetchError, ImageError, IndexError, Result};
pub use fetch::{
  FetchOutcome, FetchRequest, FetchedPayload, HttpIconFetcher, IconFetchJob, UrlFetcher,
};
pub use index::{escape_icon_url, unescape_filename, IconIndex, IconRecord, INDEX_EXT};
pub use manager::{
  FavIconListener, FavIconManager, FaviconStats, Icon, PlaceholderProvider, PLACEHOLDER_DOCUMENT,
};
pub use shared_cache::{ImageHandle, SharedImageCache};

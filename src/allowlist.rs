//! Persistent icon allowlist
//!
//! A single flat file of (document URL, icon filename, timestamp) records
//! for icons that must survive a full cache wipe — typically icons pushed
//! in on demand by an external sync source rather than picked up while
//! browsing. The list is not consulted during lookup; its only job is to
//! protect files from [`erase`](crate::manager::FavIconManager::erase_all)
//! and to reseed the per-host indexes afterwards.
//!
//! File format: UTF-8, line-triples of `document_url`, `icon_filename`,
//! `unix_timestamp_seconds`, rewritten whole on every change.

use crate::index::IconIndex;
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Name of the allowlist file inside the icon cache directory.
pub const ALLOWLIST_FILE: &str = "persistent.txt";

/// One protected icon record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentEntry {
  pub document_url: String,
  pub icon_filename: String,
  pub timestamp: u64,
}

/// Durable list of wipe-protected icons, loaded lazily from
/// `persistent.txt`.
pub struct PersistentAllowlist {
  path: PathBuf,
  entries: Vec<PersistentEntry>,
  loaded: bool,
}

impl PersistentAllowlist {
  pub fn new(icon_dir: impl AsRef<Path>) -> Self {
    Self {
      path: icon_dir.as_ref().join(ALLOWLIST_FILE),
      entries: Vec::new(),
      loaded: false,
    }
  }

  /// Record `document_url -> icon_filename` as wipe-protected, superseding
  /// any prior record for the same document URL.
  pub fn remember(&mut self, document_url: &str, icon_filename: &str) {
    debug_assert!(!document_url.is_empty(), "remember requires a document URL");
    debug_assert!(!icon_filename.is_empty(), "remember requires an icon filename");
    self.ensure_loaded();
    self.entries.retain(|entry| entry.document_url != document_url);
    self.entries.push(PersistentEntry {
      document_url: document_url.to_string(),
      icon_filename: icon_filename.to_string(),
      timestamp: now_seconds(),
    });
    self.store();
  }

  /// Whether any record protects `icon_filename` from deletion.
  pub fn protects(&mut self, icon_filename: &str) -> bool {
    self.ensure_loaded();
    self
      .entries
      .iter()
      .any(|entry| entry.icon_filename == icon_filename)
  }

  /// All current records.
  pub fn records(&mut self) -> &[PersistentEntry] {
    self.ensure_loaded();
    &self.entries
  }

  /// Replay every record through the per-host index, restoring
  /// lookupability of protected icons after a wipe.
  pub fn rebuild_indexes(&mut self, index: &mut IconIndex) {
    self.ensure_loaded();
    for entry in &self.entries {
      index.merge(&entry.document_url, &entry.icon_filename);
    }
  }

  fn ensure_loaded(&mut self) {
    if self.loaded {
      return;
    }
    self.loaded = true;
    let text = match fs::read_to_string(&self.path) {
      // Absent allowlist means nothing is protected.
      Err(_) => return,
      Ok(text) => text,
    };
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() % 3 != 0 {
      warn!(
        "allowlist {} has a torn trailing record, dropping it",
        self.path.display()
      );
    }
    self.entries = lines
      .chunks_exact(3)
      .map(|triple| PersistentEntry {
        document_url: triple[0].to_string(),
        icon_filename: triple[1].to_string(),
        timestamp: triple[2].trim().parse().unwrap_or(0),
      })
      .collect();
  }

  fn store(&self) {
    let mut out = String::new();
    for entry in &self.entries {
      out.push_str(&entry.document_url);
      out.push('\n');
      out.push_str(&entry.icon_filename);
      out.push('\n');
      out.push_str(&entry.timestamp.to_string());
      out.push('\n');
    }
    // Whole-file rewrite, same discipline as the host indexes.
    if let Err(err) = fs::write(&self.path, out) {
      warn!("failed to rewrite allowlist {}: {err}", self.path.display());
    }
  }
}

pub(crate) fn now_seconds() -> u64 {
  SystemTime::now()
    .duration_since(SystemTime::UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remember_supersedes_prior_record_for_the_same_url() {
    let tmp = tempfile::tempdir().unwrap();
    let mut allowlist = PersistentAllowlist::new(tmp.path());
    allowlist.remember("http://a.com/", "icon-v1");
    allowlist.remember("http://b.com/", "icon-b");
    allowlist.remember("http://a.com/", "icon-v2");

    let records = allowlist.records();
    assert_eq!(records.len(), 2);
    // The superseding record moved to the end.
    assert_eq!(records[0].document_url, "http://b.com/");
    assert_eq!(records[1].icon_filename, "icon-v2");

    assert!(!allowlist.protects("icon-v1"));
    assert!(allowlist.protects("icon-v2"));
    assert!(allowlist.protects("icon-b"));
  }

  #[test]
  fn records_survive_a_fresh_load_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    {
      let mut allowlist = PersistentAllowlist::new(tmp.path());
      allowlist.remember("http://a.com/", "icon-a");
    }
    let mut reloaded = PersistentAllowlist::new(tmp.path());
    assert!(reloaded.protects("icon-a"));
    assert!(reloaded.records()[0].timestamp > 0);
  }

  #[test]
  fn torn_trailing_record_is_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(
      tmp.path().join(ALLOWLIST_FILE),
      "http://a.com/\nicon-a\n1700000000\nhttp://b.com/\nicon-b\n",
    )
    .unwrap();

    let mut allowlist = PersistentAllowlist::new(tmp.path());
    assert_eq!(allowlist.records().len(), 1);
    assert!(allowlist.protects("icon-a"));
    assert!(!allowlist.protects("icon-b"));
  }

  #[test]
  fn rebuild_indexes_restores_lookupability() {
    let tmp = tempfile::tempdir().unwrap();
    let mut allowlist = PersistentAllowlist::new(tmp.path());
    allowlist.remember("http://a.com/", "icon-a");
    allowlist.remember("http://b.com/app", "icon-b");

    let mut index = IconIndex::new(tmp.path());
    allowlist.rebuild_indexes(&mut index);

    assert_eq!(index.resolve("http://a.com/page", false).as_deref(), Some("icon-a"));
    assert_eq!(index.resolve("http://b.com/app/x", false).as_deref(), Some("icon-b"));
  }
}

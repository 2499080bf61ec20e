//! Per-host durable icon index
//!
//! Each server host gets one `<host>.idx` text file mapping document URLs
//! to icon filenames. Indexes are loaded lazily, cached in memory per
//! host, and rewritten in full on every mutation — the file is never
//! appended to, so a reader always sees a complete snapshot or nothing.
//!
//! File format: UTF-8, alternating lines of `document_url` and
//! `icon_filename` (the filename is already the percent-escaped form of
//! the source icon URL). An odd line count means a torn write of the
//! trailing record; the loader drops that line and continues.

use crate::error::IndexError;
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

/// Extension of per-host index files.
pub const INDEX_EXT: &str = "idx";

/// One document-URL -> icon-filename mapping inside a host index.
///
/// Several document URLs may share one filename; after [`IconIndex::merge`]
/// reconciliation a document URL maps to at most one filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconRecord {
  pub document_url: String,
  pub icon_filename: String,
}

/// Lazily loaded cache of per-host index files.
pub struct IconIndex {
  icon_dir: PathBuf,
  hosts: FxHashMap<String, Vec<IconRecord>>,
}

impl IconIndex {
  pub fn new(icon_dir: impl Into<PathBuf>) -> Self {
    Self {
      icon_dir: icon_dir.into(),
      hosts: FxHashMap::default(),
    }
  }

  /// Resolve a document URL to its icon filename.
  ///
  /// The most specific stored URL wins: among entries whose stored URL is
  /// a literal prefix of the (slash-terminated) key, the longest one is
  /// chosen. A key without a scheme also matches stored URLs with their
  /// `scheme://` segment ignored. On a miss, `allow_near_match` falls back
  /// to the host's first entry; independently, an index holding exactly
  /// one entry matches in reverse (stored URL deeper than the key), which
  /// tolerates redirects to deeper paths on single-icon sites.
  pub fn resolve(&mut self, document_url: &str, allow_near_match: bool) -> Option<String> {
    if document_url.is_empty() {
      return None;
    }
    let host = match host_for(document_url) {
      Ok(host) => host,
      Err(err) => {
        debug!("resolve skipped: {err}");
        return None;
      }
    };
    self.ensure_loaded(&host);
    let records = self.hosts.get(&host)?;
    if records.is_empty() {
      return None;
    }

    let mut key = document_url.to_string();
    if !key.ends_with('/') {
      key.push('/');
    }
    let key_has_scheme = strip_scheme(document_url).is_some();

    let mut best: Option<&IconRecord> = None;
    for rec in records {
      let stored = rec.document_url.as_str();
      let matches = key.starts_with(stored)
        || (!key_has_scheme && strip_scheme(stored).map_or(false, |tail| key.starts_with(tail)));
      if matches && best.map_or(true, |b| stored.len() > b.document_url.len()) {
        best = Some(rec);
      }
    }
    if let Some(rec) = best {
      return Some(rec.icon_filename.clone());
    }

    if allow_near_match {
      return records.first().map(|rec| rec.icon_filename.clone());
    }

    // Reverse match is deliberately restricted to single-entry indexes;
    // with more entries it would pick between unrelated sections of a
    // site.
    if records.len() == 1 && records[0].document_url.starts_with(&key) {
      return Some(records[0].icon_filename.clone());
    }

    None
  }

  /// Insert or update the mapping `document_url -> icon_filename`,
  /// rewriting the host's index file when anything changed.
  ///
  /// An entry that already uses the filename has its stored URL
  /// generalized to the common path prefix of the old and new document
  /// URLs, so sibling pages visiting the same icon collapse into one
  /// entry. An entry with this exact document URL but another filename
  /// takes the new filename (the site's icon changed); the superseded
  /// icon file is deleted from disk unless another entry still maps to
  /// it. Returns whether the index file was rewritten.
  pub fn merge(&mut self, document_url: &str, icon_filename: &str) -> bool {
    debug_assert!(!document_url.is_empty(), "merge requires a document URL");
    debug_assert!(!icon_filename.is_empty(), "merge requires an icon filename");
    let host = match host_for(document_url) {
      Ok(host) => host,
      Err(err) => {
        debug!("merge skipped: {err}");
        return false;
      }
    };
    self.ensure_loaded(&host);
    let icon_dir = self.icon_dir.clone();
    let path = index_path(&icon_dir, &host);
    let records = self.hosts.get_mut(&host).expect("host index loaded above");

    let mut changed = false;
    let mut matched = false;
    let mut superseded: Vec<String> = Vec::new();
    for rec in records.iter_mut() {
      if rec.icon_filename == icon_filename {
        matched = true;
        if let Some(general) = generalize(&rec.document_url, document_url) {
          if general != rec.document_url {
            rec.document_url = general;
            changed = true;
          }
        }
      } else if rec.document_url == document_url {
        // The site's icon changed for this exact URL.
        matched = true;
        changed = true;
        superseded.push(std::mem::replace(
          &mut rec.icon_filename,
          icon_filename.to_string(),
        ));
      }
    }
    if !matched {
      records.push(IconRecord {
        document_url: document_url.to_string(),
        icon_filename: icon_filename.to_string(),
      });
      changed = true;
    }

    if changed {
      dedup_records(records);
      store_records(&path, records);
    }

    for old in superseded {
      if old == icon_filename {
        continue;
      }
      // Another entry may still map to the old file.
      if !records.iter().any(|rec| rec.icon_filename == old) {
        let _ = fs::remove_file(icon_dir.join(&old));
      }
    }

    changed
  }

  /// Drop every cached host index. The next access reloads from disk.
  pub fn forget_cached(&mut self) {
    self.hosts.clear();
  }

  /// Number of host indexes currently cached in memory.
  pub fn loaded_hosts(&self) -> usize {
    self.hosts.len()
  }

  /// The records stored for the host of `document_url` (empty when the
  /// URL has no host or the host has no index).
  pub fn records_for(&mut self, document_url: &str) -> &[IconRecord] {
    let Ok(host) = host_for(document_url) else {
      return &[];
    };
    self.ensure_loaded(&host);
    self.hosts.get(&host).map(Vec::as_slice).unwrap_or(&[])
  }

  fn ensure_loaded(&mut self, host: &str) {
    if !self.hosts.contains_key(host) {
      let records = load_records(&index_path(&self.icon_dir, host));
      self.hosts.insert(host.to_string(), records);
    }
  }
}

/// Derive the on-disk icon filename for a source URL by percent-escaping
/// the characters unsafe in filenames (`\ / : ~ ?`, plus `%` so the
/// escaping stays reversible).
pub fn escape_icon_url(url: &str) -> String {
  const UNSAFE: &[u8] = b"\\/:~?%";
  let mut out = String::with_capacity(url.len());
  for c in url.chars() {
    if c.is_ascii() && UNSAFE.contains(&(c as u8)) {
      out.push('%');
      out.push_str(&format!("{:02X}", c as u8));
    } else {
      out.push(c);
    }
  }
  out
}

/// Invert [`escape_icon_url`], recovering the source URL from a stored
/// filename. Malformed escapes pass through literally.
pub fn unescape_filename(filename: &str) -> String {
  let bytes = filename.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' && i + 2 < bytes.len() {
      let hi = (bytes[i + 1] as char).to_digit(16);
      let lo = (bytes[i + 2] as char).to_digit(16);
      if let (Some(hi), Some(lo)) = (hi, lo) {
        out.push(((hi << 4) | lo) as u8);
        i += 3;
        continue;
      }
    }
    out.push(bytes[i]);
    i += 1;
  }
  String::from_utf8_lossy(&out).into_owned()
}

/// Extract the lowercased server host of a URL, retrying with an assumed
/// `http://` scheme for scheme-less references.
fn host_for(url_str: &str) -> Result<String, IndexError> {
  let no_host = || IndexError::NoHost {
    url: url_str.to_string(),
  };
  let parsed = Url::parse(url_str)
    .or_else(|_| Url::parse(&format!("http://{url_str}")))
    .map_err(|_| no_host())?;
  match parsed.host_str() {
    Some(host) if !host.is_empty() => Ok(host.to_ascii_lowercase()),
    _ => Err(no_host()),
  }
}

fn strip_scheme(url: &str) -> Option<&str> {
  url.find("://").map(|idx| &url[idx + 3..])
}

/// Common path prefix of two document URLs sharing an icon, truncated at a
/// `/` boundary. Returns `None` when the URLs share no path root (for
/// example, different schemes), in which case the existing entry stands.
fn generalize(existing: &str, new: &str) -> Option<String> {
  if new.starts_with(existing) {
    // A later, deeper visit never overrides an established shorter entry.
    return Some(existing.to_string());
  }
  if existing.starts_with(new) {
    // A later, shorter visit simplifies an over-specific entry.
    return Some(new.to_string());
  }
  let mut common_len = existing
    .bytes()
    .zip(new.bytes())
    .take_while(|(a, b)| a == b)
    .count();
  while !existing.is_char_boundary(common_len) {
    common_len -= 1;
  }
  let common = &existing[..common_len];
  let slash = common.rfind('/')?;
  // Never truncate into or above the `scheme://host` authority.
  let authority_start = existing.find("://").map(|idx| idx + 3)?;
  if slash < authority_start {
    return None;
  }
  Some(common[..=slash].to_string())
}

fn index_path(icon_dir: &Path, host: &str) -> PathBuf {
  icon_dir.join(format!("{host}.{INDEX_EXT}"))
}

fn load_records(path: &Path) -> Vec<IconRecord> {
  let text = match fs::read_to_string(path) {
    // A missing or unreadable index reads as absent, never as an error.
    Err(_) => return Vec::new(),
    Ok(text) => text,
  };
  let (records, healed) = deserialize(&text, path);
  if let Some(err) = healed {
    warn!("{err}");
  }
  records
}

fn deserialize(text: &str, origin: &Path) -> (Vec<IconRecord>, Option<IndexError>) {
  let lines: Vec<&str> = text.lines().collect();
  let healed = (lines.len() % 2 != 0).then(|| IndexError::Corrupt {
    path: origin.display().to_string(),
    reason: "odd line count, dropping trailing line".to_string(),
  });
  let records = lines
    .chunks_exact(2)
    .map(|pair| IconRecord {
      document_url: pair[0].to_string(),
      icon_filename: pair[1].to_string(),
    })
    .collect();
  (records, healed)
}

fn serialize(records: &[IconRecord]) -> String {
  let mut out = String::new();
  for rec in records {
    out.push_str(&rec.document_url);
    out.push('\n');
    out.push_str(&rec.icon_filename);
    out.push('\n');
  }
  out
}

fn store_records(path: &Path, records: &[IconRecord]) {
  // Whole-file rewrite: read fully, mutate in memory, write fully.
  if let Err(err) = fs::write(path, serialize(records)) {
    warn!("failed to rewrite index {}: {err}", path.display());
  }
}

fn dedup_records(records: &mut Vec<IconRecord>) {
  let mut seen: FxHashSet<(String, String)> = FxHashSet::default();
  records.retain(|rec| seen.insert((rec.document_url.clone(), rec.icon_filename.clone())));
}

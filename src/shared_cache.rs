//! Shared decoded-bitmap cache
//!
//! At most one decoded bitmap is resident per icon filename, shared by
//! every document URL that resolves to it and reference-counted by
//! [`ImageHandle`] ownership. The table is single-threaded interior state
//! (`Rc<RefCell<..>>`) per the cache's event-driven concurrency model;
//! handles release their reference on drop, so there is no manual refcount
//! bookkeeping anywhere else in the crate.

use crate::bitmap;
use image::RgbaImage;
use log::warn;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Process-wide cache of decoded icon bitmaps, keyed by icon filename.
pub struct SharedImageCache {
  icon_dir: PathBuf,
  table: Rc<RefCell<CacheTable>>,
}

#[derive(Default)]
struct CacheTable {
  entries: FxHashMap<String, CacheSlot>,
  // Distinguishes a slot from a same-named successor created after a
  // wholesale clear, so stale handles can never evict the newcomer.
  next_generation: u64,
}

struct CacheSlot {
  bitmap: Rc<RgbaImage>,
  source_document_url: String,
  refcount: usize,
  generation: u64,
}

/// Owned reference to one cached bitmap.
///
/// Dropping the handle decrements the entry's refcount and removes the
/// table entry when it reaches zero. After [`SharedImageCache::clear`] a
/// live handle stays safe to use but reads as empty.
pub struct ImageHandle {
  table: Rc<RefCell<CacheTable>>,
  filename: String,
  generation: u64,
}

impl SharedImageCache {
  pub fn new(icon_dir: impl Into<PathBuf>) -> Self {
    Self {
      icon_dir: icon_dir.into(),
      table: Rc::new(RefCell::new(CacheTable::default())),
    }
  }

  /// Return a handle to the bitmap for `filename`, decoding and inserting
  /// it on first use.
  ///
  /// A file that is missing or fails to decode yields an entry holding an
  /// empty bitmap; callers treat that as "no icon", never as an error.
  pub fn acquire(&self, filename: &str, document_url: &str) -> ImageHandle {
    let mut table = self.table.borrow_mut();
    if let Some(slot) = table.entries.get_mut(filename) {
      slot.refcount += 1;
      let generation = slot.generation;
      drop(table);
      return self.handle_for(filename, generation);
    }

    let generation = table.next_generation;
    table.next_generation += 1;
    let bitmap = load_bitmap(&self.icon_dir, filename);
    table.entries.insert(
      filename.to_string(),
      CacheSlot {
        bitmap: Rc::new(bitmap),
        source_document_url: document_url.to_string(),
        refcount: 1,
        generation,
      },
    );
    drop(table);
    self.handle_for(filename, generation)
  }

  fn handle_for(&self, filename: &str, generation: u64) -> ImageHandle {
    ImageHandle {
      table: Rc::clone(&self.table),
      filename: filename.to_string(),
      generation,
    }
  }

  /// Re-decode `filename` from disk and swap the bitmap in place.
  ///
  /// Every current handle observes the new bitmap; the dedup key and the
  /// refcount are untouched. No-op when the filename is not resident.
  pub fn reload(&self, filename: &str) {
    let mut table = self.table.borrow_mut();
    if table.entries.contains_key(filename) {
      let bitmap = Rc::new(load_bitmap(&self.icon_dir, filename));
      if let Some(slot) = table.entries.get_mut(filename) {
        slot.bitmap = bitmap;
      }
    }
  }

  /// Drop every entry wholesale. Outstanding handles become detached and
  /// read as empty; their eventual drop is a no-op.
  pub fn clear(&self) {
    self.table.borrow_mut().entries.clear();
  }

  /// Whether a bitmap for `filename` is currently resident.
  pub fn resident(&self, filename: &str) -> bool {
    self.table.borrow().entries.contains_key(filename)
  }

  /// Number of resident bitmaps.
  pub fn len(&self) -> usize {
    self.table.borrow().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[cfg(test)]
  fn refcount(&self, filename: &str) -> Option<usize> {
    self.table.borrow().entries.get(filename).map(|s| s.refcount)
  }
}

impl ImageHandle {
  /// The decoded bitmap. Empty (0x0) when the underlying file was
  /// unreadable or the entry has been cleared from under this handle.
  pub fn bitmap(&self) -> Rc<RgbaImage> {
    self
      .table
      .borrow()
      .entries
      .get(&self.filename)
      .filter(|slot| slot.generation == self.generation)
      .map(|slot| Rc::clone(&slot.bitmap))
      .unwrap_or_else(|| Rc::new(RgbaImage::new(0, 0)))
  }

  /// The dedup key this handle references.
  pub fn filename(&self) -> &str {
    &self.filename
  }

  /// The document URL that first caused this bitmap to load, when the
  /// entry is still resident.
  pub fn source_document_url(&self) -> Option<String> {
    self
      .table
      .borrow()
      .entries
      .get(&self.filename)
      .filter(|slot| slot.generation == self.generation)
      .map(|slot| slot.source_document_url.clone())
  }

  /// True when the referenced bitmap has no pixels.
  pub fn is_empty(&self) -> bool {
    let bitmap = self.bitmap();
    bitmap.width() == 0 || bitmap.height() == 0
  }
}

impl Clone for ImageHandle {
  fn clone(&self) -> Self {
    let mut table = self.table.borrow_mut();
    if let Some(slot) = table.entries.get_mut(&self.filename) {
      if slot.generation == self.generation {
        slot.refcount += 1;
      }
    }
    drop(table);
    Self {
      table: Rc::clone(&self.table),
      filename: self.filename.clone(),
      generation: self.generation,
    }
  }
}

impl Drop for ImageHandle {
  fn drop(&mut self) {
    let mut table = self.table.borrow_mut();
    let evict = match table.entries.get_mut(&self.filename) {
      Some(slot) if slot.generation == self.generation => {
        slot.refcount -= 1;
        slot.refcount == 0
      }
      _ => false,
    };
    if evict {
      table.entries.remove(&self.filename);
    }
  }
}

fn load_bitmap(icon_dir: &Path, filename: &str) -> RgbaImage {
  let path = icon_dir.join(filename);
  let bytes = match fs::read(&path) {
    Ok(bytes) => bytes,
    Err(err) => {
      warn!("icon file {} unreadable: {err}", path.display());
      return RgbaImage::new(0, 0);
    }
  };
  match bitmap::decode(&bytes, None) {
    Ok(img) => img,
    Err(err) => {
      warn!("icon file {} failed to decode: {err}", path.display());
      RgbaImage::new(0, 0)
    }
  }
}

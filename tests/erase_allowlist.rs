//! Full-wipe semantics: everything goes except what the persistent
//! allowlist protects.

use fasticon::{
  FavIconListener, FavIconManager, FetchError, FetchRequest, FetchedPayload, Icon, UrlFetcher,
  ALLOWLIST_FILE,
};
use image::{ImageFormat, RgbaImage};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Cursor;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn png_bytes(shade: u8) -> Vec<u8> {
  let img = RgbaImage::from_pixel(16, 16, image::Rgba([shade, 0, 0, 255]));
  let mut cursor = Cursor::new(Vec::new());
  img.write_to(&mut cursor, ImageFormat::Png).expect("encode png");
  cursor.into_inner()
}

struct ScriptedFetcher {
  responses: Mutex<HashMap<String, FetchedPayload>>,
}

impl ScriptedFetcher {
  fn new() -> Self {
    Self {
      responses: Mutex::new(HashMap::new()),
    }
  }

  fn script(self, icon_url: &str, bytes: Vec<u8>) -> Self {
    self.responses.lock().unwrap().insert(
      icon_url.to_string(),
      FetchedPayload {
        bytes,
        content_type: Some("image/png".to_string()),
      },
    );
    self
  }
}

impl UrlFetcher for ScriptedFetcher {
  fn fetch(&self, request: &FetchRequest) -> Result<FetchedPayload, FetchError> {
    self
      .responses
      .lock()
      .unwrap()
      .get(&request.icon_url)
      .cloned()
      .ok_or_else(|| FetchError::Http {
        url: request.icon_url.clone(),
        reason: "not scripted".to_string(),
      })
  }
}

#[derive(Default)]
struct WipeListener {
  wipes: Rc<RefCell<usize>>,
}

impl FavIconListener for WipeListener {
  fn on_all_icons_removed(&self) {
    *self.wipes.borrow_mut() += 1;
  }
}

fn drain(manager: &mut FavIconManager) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while manager.stats().pending_fetches > 0 {
    manager.process_pending();
    assert!(Instant::now() < deadline, "fetch jobs never drained");
    thread::sleep(Duration::from_millis(5));
  }
}

#[test]
fn erase_spares_on_demand_icons_and_drops_the_rest() {
  let tmp = tempfile::tempdir().unwrap();
  let fetcher = Arc::new(
    ScriptedFetcher::new()
      .script("http://synced.example/favicon.ico", png_bytes(10))
      .script("http://casual.example/favicon.ico", png_bytes(20)),
  );
  let mut manager = FavIconManager::new(tmp.path()).with_fetcher(fetcher);
  let wipes = Rc::new(RefCell::new(0));
  manager.add_listener(Box::new(WipeListener {
    wipes: Rc::clone(&wipes),
  }));

  // One icon pushed in on demand (external sync), one picked up casually.
  assert!(manager.add_url(
    "http://synced.example/",
    "http://synced.example/favicon.ico",
    true,
    0
  ));
  assert!(manager.add_url(
    "http://casual.example/",
    "http://casual.example/favicon.ico",
    false,
    0
  ));
  drain(&mut manager);

  assert!(matches!(
    manager.lookup("http://synced.example/", false, false),
    Icon::Cached(_)
  ));
  assert!(matches!(
    manager.lookup("http://casual.example/", false, false),
    Icon::Cached(_)
  ));

  manager.erase_all();
  assert_eq!(*wipes.borrow(), 1);

  // The protected icon still resolves and loads; the casual one is gone.
  match manager.lookup("http://synced.example/", false, false) {
    Icon::Cached(handle) => assert!(!handle.is_empty()),
    _ => panic!("allowlisted icon must survive the wipe"),
  }
  assert!(manager
    .lookup("http://casual.example/", false, false)
    .is_missing());

  // On disk: the allowlist file, the protected icon file and the rebuilt
  // host index for it; nothing of the casual site.
  let names: Vec<String> = std::fs::read_dir(tmp.path())
    .unwrap()
    .flatten()
    .map(|entry| entry.file_name().to_string_lossy().into_owned())
    .collect();
  assert!(names.contains(&ALLOWLIST_FILE.to_string()));
  assert!(names.contains(&"http%3A%2F%2Fsynced.example%2Ffavicon.ico".to_string()));
  assert!(names.contains(&"synced.example.idx".to_string()));
  assert!(!names.iter().any(|name| name.contains("casual.example")));
}

#[test]
fn erase_on_an_empty_cache_is_harmless() {
  let tmp = tempfile::tempdir().unwrap();
  let mut manager = FavIconManager::new(tmp.path());
  manager.erase_all();
  assert!(manager.lookup("http://example.com/", false, true).is_missing());
  assert_eq!(manager.stats().resident_images, 0);
}

#[test]
fn an_updated_on_demand_icon_replaces_its_allowlist_record() {
  let tmp = tempfile::tempdir().unwrap();
  let fetcher = Arc::new(
    ScriptedFetcher::new()
      .script("http://a.com/v1.ico", png_bytes(1))
      .script("http://a.com/v2.ico", png_bytes(2)),
  );
  let mut manager = FavIconManager::new(tmp.path()).with_fetcher(fetcher);

  assert!(manager.add_url("http://a.com/", "http://a.com/v1.ico", true, 0));
  drain(&mut manager);
  assert!(manager.add_url("http://a.com/", "http://a.com/v2.ico", true, 0));
  drain(&mut manager);

  manager.erase_all();

  // Only the superseding record protects a file now.
  match manager.lookup("http://a.com/", false, false) {
    Icon::Cached(handle) => {
      assert_eq!(handle.filename(), "http%3A%2F%2Fa.com%2Fv2.ico");
      assert!(!handle.is_empty());
    }
    _ => panic!("updated on-demand icon must survive"),
  }
  assert!(!tmp.path().join("http%3A%2F%2Fa.com%2Fv1.ico").exists());
}

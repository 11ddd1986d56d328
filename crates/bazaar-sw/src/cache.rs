//! Versioned response caches.
//!
//! Each deployed version of the storefront owns one cache generation,
//! named by the deployment's version label. A generation is populated
//! at install time from the precache manifest and grows at runtime as
//! successful responses stream through the fetch path. Activation of a
//! new version deletes every generation that does not carry the new
//! label, so at most one generation survives between upgrades.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use tracing::debug;
use url::Url;

use bazaar_net::{Request, Response};

/// Composes the lookup key for a request: method plus full URL.
///
/// The query string is significant; two URLs differing only in their
/// query are distinct resources.
pub fn request_key(method: &Method, url: &Url) -> String {
    format!("{} {}", method, url)
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL the response was served for.
    pub url: Url,
    /// Request method (GET in practice; the fetch path filters the rest).
    pub method: Method,
    /// Response status at capture time.
    pub status: StatusCode,
    /// Response headers at capture time.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// Milliseconds since the epoch when the entry was stored.
    pub stored_at: u64,
}

impl CacheEntry {
    /// Captures a response for the given request.
    pub fn capture(request: &Request, response: &Response) -> Self {
        Self {
            url: request.url.clone(),
            method: request.method.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: epoch_millis(),
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> String {
        request_key(&self.method, &self.url)
    }

    /// Rebuilds a servable response from the snapshot.
    pub fn to_response(&self) -> Response {
        Response {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            url: self.url.clone(),
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One named cache generation.
#[derive(Debug, Default)]
pub struct CacheGeneration {
    name: String,
    entries: HashMap<String, CacheEntry>,
}

impl CacheGeneration {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Generation name (the version label it belongs to).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a stored entry by request key.
    pub fn match_key(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Stores an entry, replacing any previous snapshot for the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        debug!(
            cache = %self.name,
            url = %entry.url,
            status = %entry.status,
            "cache put"
        );
        self.entries.insert(entry.key(), entry);
    }

    /// Removes an entry. Returns whether one was present.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Keys of every stored entry.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The full cache store: every generation currently on disk.
///
/// Shared between worker contexts behind a lock; a single operation
/// (put, match, delete) is atomic, sequences of operations are not.
#[derive(Debug, Default)]
pub struct CacheStorage {
    generations: HashMap<String, CacheGeneration>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a generation, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut CacheGeneration {
        self.generations
            .entry(name.to_string())
            .or_insert_with(|| CacheGeneration::new(name))
    }

    /// Borrows a generation without creating it.
    pub fn generation(&self, name: &str) -> Option<&CacheGeneration> {
        self.generations.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.generations.contains_key(name)
    }

    /// Deletes a whole generation. Returns whether one was present.
    pub fn delete(&mut self, name: &str) -> bool {
        let existed = self.generations.remove(name).is_some();
        if existed {
            debug!(cache = %name, "cache generation deleted");
        }
        existed
    }

    /// Names of every generation, in no particular order.
    pub fn generation_names(&self) -> Vec<String> {
        self.generations.keys().cloned().collect()
    }

    /// Looks up a key inside one generation.
    pub fn match_in(&self, generation: &str, key: &str) -> Option<&CacheEntry> {
        self.generations.get(generation).and_then(|g| g.match_key(key))
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_net::Request;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry_for(u: &str, body: &str) -> CacheEntry {
        let request = Request::get(url(u));
        let response = Response::with_body(StatusCode::OK, url(u), "text/html", body.to_string());
        CacheEntry::capture(&request, &response)
    }

    #[test]
    fn test_request_key_includes_method_and_query() {
        let a = request_key(&Method::GET, &url("https://shop.example/catalog?page=1"));
        let b = request_key(&Method::GET, &url("https://shop.example/catalog?page=2"));
        let c = request_key(&Method::HEAD, &url("https://shop.example/catalog?page=1"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "GET https://shop.example/catalog?page=1");
    }

    #[test]
    fn test_put_and_match() {
        let mut store = CacheStorage::new();
        let entry = entry_for("https://shop.example/", "<html>home</html>");
        let key = entry.key();
        store.open("bazaar-v1").put(entry);

        let hit = store.match_in("bazaar-v1", &key).unwrap();
        assert_eq!(hit.body, Bytes::from("<html>home</html>"));
        assert!(store.match_in("bazaar-v2", &key).is_none());
    }

    #[test]
    fn test_put_replaces_previous_snapshot() {
        let mut store = CacheStorage::new();
        let key = entry_for("https://shop.example/", "old").key();
        store.open("bazaar-v1").put(entry_for("https://shop.example/", "old"));
        store.open("bazaar-v1").put(entry_for("https://shop.example/", "new"));

        assert_eq!(store.generation("bazaar-v1").unwrap().len(), 1);
        let hit = store.match_in("bazaar-v1", &key).unwrap();
        assert_eq!(hit.body, Bytes::from("new"));
    }

    #[test]
    fn test_delete_generation() {
        let mut store = CacheStorage::new();
        store.open("bazaar-v1").put(entry_for("https://shop.example/", "x"));
        store.open("bazaar-v2");

        assert!(store.delete("bazaar-v1"));
        assert!(!store.delete("bazaar-v1"));
        assert!(!store.has("bazaar-v1"));
        assert!(store.has("bazaar-v2"));
    }

    #[test]
    fn test_entry_round_trips_to_response() {
        let request = Request::get(url("https://shop.example/styles.css"));
        let response = Response::with_body(
            StatusCode::OK,
            url("https://shop.example/styles.css"),
            "text/css",
            "body{}",
        );
        let entry = CacheEntry::capture(&request, &response);
        let served = entry.to_response();

        assert_eq!(served.status, StatusCode::OK);
        assert_eq!(served.body, Bytes::from("body{}"));
        assert_eq!(served.header("content-type"), Some("text/css"));
    }

    #[test]
    fn test_generation_names_lists_all() {
        let mut store = CacheStorage::new();
        store.open("bazaar-v1");
        store.open("bazaar-v2");
        store.open("bazaar-v3");

        let mut names = store.generation_names();
        names.sort();
        assert_eq!(names, vec!["bazaar-v1", "bazaar-v2", "bazaar-v3"]);
    }
}

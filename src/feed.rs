use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;

use crate::backend::{
    Document, DocumentStore, PageCursor, Post, Query, SnapshotEvent, StoreError, POSTS_COLLECTION,
};

fn sync_debug_enabled() -> bool {
    static FLAG: OnceCell<bool> = OnceCell::new();
    *FLAG.get_or_init(|| {
        std::env::var("MURAL_DEBUG_SYNC")
            .map(|val| {
                let trimmed = val.trim();
                !(trimmed.is_empty()
                    || trimmed.eq_ignore_ascii_case("0")
                    || trimmed.eq_ignore_ascii_case("false")
                    || trimmed.eq_ignore_ascii_case("no")
                    || trimmed.eq_ignore_ascii_case("off"))
            })
            .unwrap_or(false)
    })
}

fn sync_debug_writer() -> Option<&'static Mutex<std::fs::File>> {
    static WRITER: OnceCell<Option<Mutex<std::fs::File>>> = OnceCell::new();
    WRITER
        .get_or_init(|| {
            std::env::var("MURAL_DEBUG_SYNC_LOG")
                .ok()
                .and_then(|path| {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map(Mutex::new)
                        .ok()
                })
        })
        .as_ref()
}

pub fn debug_log(message: impl AsRef<str>) {
    if !sync_debug_enabled() {
        return;
    }
    if let Some(writer) = sync_debug_writer() {
        if let Ok(mut file) = writer.lock() {
            let _ = writeln!(file, "{}", message.as_ref());
            return;
        }
    }
    eprintln!("{}", message.as_ref());
}

/// One visible post. `paged` marks entries loaded through an explicit
/// older-page fetch; the live window never evicts those.
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub id: String,
    pub post: Post,
    pub paged: bool,
}

/// Pure merge state for the visible list: live head window reconciled with
/// cursor-paged older entries, newest first, no duplicates. Holds no channels
/// or handles so the reconciliation rules are testable on their own.
#[derive(Default)]
pub struct Synchronizer {
    entries: Vec<FeedEntry>,
    ids: HashSet<String>,
    cursor: Option<PageCursor>,
    reached_end: bool,
    stalled: bool,
}

impl Synchronizer {
    pub fn entries(&self) -> &[FeedEntry] {
        &self.entries
    }

    pub fn cursor(&self) -> Option<&PageCursor> {
        self.cursor.as_ref()
    }

    pub fn reached_end(&self) -> bool {
        self.reached_end
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
        self.cursor = None;
        self.reached_end = false;
        self.stalled = false;
    }

    /// Applies one delivery of the live window. An empty snapshot renders
    /// nothing and leaves the cursor unset. Otherwise the snapshot's oldest
    /// document becomes the new cursor, every document is upserted in
    /// descending creation order, and rendered entries that dropped out of
    /// the window are evicted unless they were paged in. A freshly evicted
    /// entry is not lost for good: the cursor now sits above it, so the next
    /// older-page fetch returns it as pagination-sourced.
    pub fn apply_snapshot(&mut self, docs: Vec<Document>) {
        if self.stalled {
            debug_log("sync: snapshot ignored, feed is stalled");
            return;
        }
        if docs.is_empty() {
            return;
        }

        let cursor = docs
            .last()
            .and_then(|doc| PageCursor::after(doc, crate::backend::CREATED_AT_FIELD));
        if cursor != self.cursor {
            self.cursor = cursor;
            // New posts can regrow the tail past a previously exhausted cursor.
            self.reached_end = false;
        }

        let live: HashSet<&str> = docs.iter().map(|doc| doc.id.as_str()).collect();
        self.entries
            .retain(|entry| entry.paged || live.contains(entry.id.as_str()));
        self.ids = self.entries.iter().map(|entry| entry.id.clone()).collect();

        for doc in docs {
            let post = match Post::from_document(&doc) {
                Ok(post) => post,
                Err(err) => {
                    debug_log(format!("sync: skipping {}: {}", doc.id, err));
                    continue;
                }
            };
            if self.ids.contains(&doc.id) {
                if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == doc.id) {
                    entry.post = post;
                }
                continue;
            }
            let position = self
                .entries
                .iter()
                .position(|entry| match (entry.post.created_at, post.created_at) {
                    (Some(existing), Some(incoming)) => existing < incoming,
                    // Entries without a timestamp sort as oldest.
                    (None, Some(_)) => true,
                    _ => false,
                })
                .unwrap_or(self.entries.len());
            self.ids.insert(doc.id.clone());
            self.entries.insert(
                position,
                FeedEntry {
                    id: doc.id,
                    post,
                    paged: false,
                },
            );
        }
    }

    /// Applies one older-page batch. Documents already rendered are skipped,
    /// the rest are appended in the order the backend returned them and
    /// marked pagination-sourced. The cursor advances to the batch's oldest
    /// document even when every document was a duplicate; an empty batch
    /// means the tail is exhausted.
    pub fn apply_page(&mut self, docs: Vec<Document>) {
        if docs.is_empty() {
            self.reached_end = true;
            return;
        }

        if let Some(cursor) = docs
            .last()
            .and_then(|doc| PageCursor::after(doc, crate::backend::CREATED_AT_FIELD))
        {
            self.cursor = Some(cursor);
        }

        for doc in docs {
            if self.ids.contains(&doc.id) {
                continue;
            }
            let post = match Post::from_document(&doc) {
                Ok(post) => post,
                Err(err) => {
                    debug_log(format!("sync: skipping {}: {}", doc.id, err));
                    continue;
                }
            };
            self.ids.insert(doc.id.clone());
            self.entries.push(FeedEntry {
                id: doc.id,
                post,
                paged: true,
            });
        }
    }

    fn stall(&mut self) {
        self.stalled = true;
    }
}

struct PendingPage {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
}

struct PageResponse {
    request_id: u64,
    result: Result<Vec<Document>, StoreError>,
}

/// Owns the live subscription and the older-page worker for one session.
/// Snapshot deliveries and page results land on channels that only `pump`
/// drains, so every list mutation happens on the caller's thread; the live
/// stream and an in-flight fetch can never interleave mid-update.
pub struct FeedController {
    store: Arc<dyn DocumentStore>,
    window_size: usize,
    sync: Synchronizer,
    snapshot_rx: Option<Receiver<SnapshotEvent>>,
    subscription: Option<crate::backend::Subscription>,
    page_tx: Sender<PageResponse>,
    page_rx: Receiver<PageResponse>,
    pending_page: Option<PendingPage>,
    next_request_id: u64,
    status: Option<String>,
}

impl FeedController {
    pub fn new(store: Arc<dyn DocumentStore>, window_size: usize) -> Self {
        let (page_tx, page_rx) = unbounded();
        Self {
            store,
            window_size,
            sync: Synchronizer::default(),
            snapshot_rx: None,
            subscription: None,
            page_tx,
            page_rx,
            pending_page: None,
            next_request_id: 0,
            status: None,
        }
    }

    pub fn entries(&self) -> &[FeedEntry] {
        self.sync.entries()
    }

    pub fn reached_end(&self) -> bool {
        self.sync.reached_end()
    }

    pub fn stalled(&self) -> bool {
        self.sync.stalled()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn is_loading_older(&self) -> bool {
        self.pending_page.is_some()
    }

    /// Begins the live head-window subscription. The previous session must
    /// have been stopped first.
    pub fn start(&mut self) -> Result<()> {
        if self.subscription.is_some() {
            bail!("feed: subscription already active, call stop first");
        }
        self.sync.clear();
        self.status = None;

        let (tx, rx) = unbounded();
        let query = Query::newest(POSTS_COLLECTION, self.window_size);
        match self.store.subscribe(query, tx) {
            Ok(subscription) => {
                self.snapshot_rx = Some(rx);
                self.subscription = Some(subscription);
                debug_log(format!("sync: started, window {}", self.window_size));
                Ok(())
            }
            Err(err) => {
                self.status = Some(format!("Feed unavailable: {}", err));
                self.sync.stall();
                Ok(())
            }
        }
    }

    /// Releases the subscription and discards any in-flight page fetch.
    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(pending) = self.pending_page.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.subscription = None;
        self.snapshot_rx = None;
        debug_log("sync: stopped");
    }

    /// Requests the next page of posts older than the cursor. A no-op while
    /// a fetch is in flight, before the first snapshot established a cursor,
    /// or once the tail is exhausted; safe to call from a repeating trigger.
    pub fn load_older(&mut self) {
        if self.pending_page.is_some() || self.sync.reached_end() || self.sync.stalled() {
            return;
        }
        let Some(cursor) = self.sync.cursor().cloned() else {
            return;
        };

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_page = Some(PendingPage {
            request_id,
            cancel_flag: cancel_flag.clone(),
        });

        let store = self.store.clone();
        let tx = self.page_tx.clone();
        let query = Query::newest(POSTS_COLLECTION, self.window_size);
        thread::spawn(move || {
            let result = store.fetch_page(&query, Some(&cursor));
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(PageResponse { request_id, result });
        });
    }

    /// Drains pending snapshot and page deliveries, applying each in arrival
    /// order. Returns true when the visible list or status changed.
    pub fn pump(&mut self) -> bool {
        let mut changed = false;

        if let Some(rx) = self.snapshot_rx.clone() {
            while let Ok(event) = rx.try_recv() {
                match event {
                    SnapshotEvent::Snapshot(docs) => {
                        debug_log(format!("sync: snapshot of {} docs", docs.len()));
                        self.sync.apply_snapshot(docs);
                    }
                    SnapshotEvent::Error(err) => {
                        debug_log(format!("sync: subscription error: {}", err));
                        self.status = Some(format!("Feed stalled: {}", err));
                        self.sync.stall();
                    }
                }
                changed = true;
            }
        }

        while let Ok(response) = self.page_rx.try_recv() {
            let Some(pending) = &self.pending_page else {
                continue;
            };
            if pending.request_id != response.request_id {
                continue;
            }
            self.pending_page = None;
            match response.result {
                Ok(docs) => {
                    debug_log(format!("sync: older page of {} docs", docs.len()));
                    self.sync.apply_page(docs);
                }
                Err(err) => {
                    self.status = Some(format!("Failed to load older posts: {}", err));
                }
            }
            changed = true;
        }

        changed
    }
}

impl Drop for FeedController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CREATED_AT_FIELD;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn doc(id: &str, ts: &str) -> Document {
        let mut fields = Map::new();
        fields.insert("authorUid".into(), json!("u1"));
        fields.insert("authorEmail".into(), json!("admin@example.com"));
        fields.insert("text".into(), json!(format!("post {}", id)));
        fields.insert(CREATED_AT_FIELD.into(), json!(ts));
        Document {
            id: id.to_string(),
            fields,
        }
    }

    fn ts(n: u32) -> String {
        format!("2024-05-01T10:{:02}:{:02}Z", n / 60, n % 60)
    }

    fn ids(sync: &Synchronizer) -> Vec<&str> {
        sync.entries().iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn fixture_timestamps_parse_past_a_minute() {
        let later = chrono::DateTime::parse_from_rfc3339(&ts(60)).unwrap();
        let earlier = chrono::DateTime::parse_from_rfc3339(&ts(55)).unwrap();
        assert!(later > earlier);
    }

    #[test]
    fn empty_snapshot_leaves_cursor_unset() {
        let mut sync = Synchronizer::default();
        sync.apply_snapshot(Vec::new());
        assert!(sync.entries().is_empty());
        assert!(sync.cursor().is_none());
    }

    #[test]
    fn snapshot_upserts_in_descending_order() {
        let mut sync = Synchronizer::default();
        sync.apply_snapshot(vec![doc("b", &ts(20)), doc("a", &ts(10))]);
        assert_eq!(ids(&sync), vec!["b", "a"]);

        // A newer post arrives; the window shifts but still contains "a".
        sync.apply_snapshot(vec![doc("c", &ts(30)), doc("b", &ts(20)), doc("a", &ts(10))]);
        assert_eq!(ids(&sync), vec!["c", "b", "a"]);
        assert!(sync.cursor().is_some());
    }

    #[test]
    fn repeated_snapshot_never_duplicates() {
        let mut sync = Synchronizer::default();
        let snap = vec![doc("b", &ts(20)), doc("a", &ts(10))];
        sync.apply_snapshot(snap.clone());
        sync.apply_snapshot(snap);
        assert_eq!(ids(&sync), vec!["b", "a"]);
    }

    #[test]
    fn live_item_pushed_out_of_window_is_evicted() {
        let mut sync = Synchronizer::default();
        sync.apply_snapshot(vec![doc("b", &ts(20)), doc("a", &ts(10))]);
        // Window of two: "c" arrives, "a" drops out and was never paged in.
        sync.apply_snapshot(vec![doc("c", &ts(30)), doc("b", &ts(20))]);
        assert_eq!(ids(&sync), vec!["c", "b"]);
    }

    #[test]
    fn paged_items_survive_window_shift() {
        let mut sync = Synchronizer::default();
        sync.apply_snapshot(vec![doc("c", &ts(30)), doc("b", &ts(20))]);
        sync.apply_page(vec![doc("a", &ts(10))]);
        assert_eq!(ids(&sync), vec!["c", "b", "a"]);

        sync.apply_snapshot(vec![doc("d", &ts(40)), doc("c", &ts(30))]);
        assert_eq!(ids(&sync), vec!["d", "c", "a"]);
        assert!(sync.entries().last().unwrap().paged);
    }

    #[test]
    fn visible_list_is_paged_union_latest_snapshot() {
        // Property: after any sequence, entries = paged ids + ids of the
        // final snapshot, without duplicates.
        let mut sync = Synchronizer::default();
        sync.apply_snapshot(vec![doc("e", &ts(50)), doc("d", &ts(40))]);
        sync.apply_page(vec![doc("c", &ts(30)), doc("b", &ts(20))]);
        sync.apply_snapshot(vec![doc("f", &ts(55)), doc("e", &ts(50))]);
        sync.apply_page(vec![doc("a", &ts(10))]);
        sync.apply_snapshot(vec![doc("g", &ts(60)), doc("f", &ts(55))]);

        let mut expected = vec!["g", "f", "c", "b", "a"];
        expected.sort_unstable();
        let mut got = ids(&sync);
        got.sort_unstable();
        assert_eq!(got, expected);

        let unique: HashSet<_> = sync.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(unique.len(), sync.entries().len());
    }

    #[test]
    fn page_skips_duplicates_but_advances_cursor() {
        let mut sync = Synchronizer::default();
        sync.apply_snapshot(vec![doc("b", &ts(20)), doc("a", &ts(10))]);
        let before = sync.cursor().cloned();
        sync.apply_page(vec![doc("a", &ts(10)), doc("z", &ts(5))]);
        assert_eq!(ids(&sync), vec!["b", "a", "z"]);
        assert_ne!(sync.cursor().cloned(), before);
    }

    #[test]
    fn empty_page_marks_end_until_new_posts_arrive() {
        let mut sync = Synchronizer::default();
        sync.apply_snapshot(vec![doc("a", &ts(10))]);
        sync.apply_page(Vec::new());
        assert!(sync.reached_end());

        // A new post moves the cursor, so the tail may have regrown.
        sync.apply_snapshot(vec![doc("b", &ts(20))]);
        assert!(!sync.reached_end());
    }

    #[test]
    fn controller_load_older_without_cursor_is_noop() {
        let backend = crate::memory::MemoryBackend::new(crate::admin::AdminList::new([
            "admin@example.com",
        ]));
        let mut feed = FeedController::new(backend.store(), 2);
        feed.start().unwrap();
        feed.pump();
        feed.load_older();
        assert!(feed.pending_page.is_none());
        assert!(feed.entries().is_empty());
    }

    #[test]
    fn controller_load_older_is_idempotent_in_flight() {
        let backend = seeded_backend(5);
        let mut feed = FeedController::new(backend.store(), 2);
        feed.start().unwrap();
        feed.pump();
        assert_eq!(feed.entries().len(), 2);

        feed.load_older();
        let first_request = feed.pending_page.as_ref().unwrap().request_id;
        feed.load_older();
        feed.load_older();
        assert_eq!(feed.pending_page.as_ref().unwrap().request_id, first_request);

        wait_for_page(&mut feed);
        assert_eq!(feed.entries().len(), 4);
    }

    #[test]
    fn controller_start_twice_errors() {
        let backend = seeded_backend(1);
        let mut feed = FeedController::new(backend.store(), 2);
        feed.start().unwrap();
        assert!(feed.start().is_err());
        feed.stop();
        feed.start().unwrap();
    }

    #[test]
    fn stopped_controller_discards_late_page() {
        let backend = seeded_backend(5);
        let mut feed = FeedController::new(backend.store(), 2);
        feed.start().unwrap();
        feed.pump();
        feed.load_older();
        feed.stop();
        // Restart: a late result from the cancelled fetch must not land.
        feed.start().unwrap();
        for _ in 0..20 {
            feed.pump();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(feed.entries().len(), 2);
        assert!(feed.entries().iter().all(|entry| !entry.paged));
    }

    #[test]
    fn live_post_arrives_through_subscription() {
        let backend = seeded_backend(1);
        let mut feed = FeedController::new(backend.store(), 5);
        feed.start().unwrap();
        feed.pump();
        assert_eq!(feed.entries().len(), 1);

        seed_post(&backend, "later");
        feed.pump();
        assert_eq!(feed.entries().len(), 2);
        assert_eq!(
            feed.entries()[0].post.text.as_deref(),
            Some("later")
        );
    }

    fn seeded_backend(posts: usize) -> crate::memory::MemoryBackend {
        let backend = crate::memory::MemoryBackend::new(crate::admin::AdminList::new([
            "admin@example.com",
        ]));
        for n in 0..posts {
            seed_post(&backend, &format!("post {}", n));
        }
        backend
    }

    fn seed_post(backend: &crate::memory::MemoryBackend, text: &str) {
        let mut fields = Map::new();
        fields.insert("authorUid".into(), json!("u1"));
        fields.insert("authorEmail".into(), json!("admin@example.com"));
        fields.insert("text".into(), json!(text));
        fields.insert(CREATED_AT_FIELD.into(), crate::backend::server_timestamp());
        backend.seed_document(POSTS_COLLECTION, fields);
    }

    fn wait_for_page(feed: &mut FeedController) {
        for _ in 0..100 {
            feed.pump();
            if feed.pending_page.is_none() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("page fetch never completed");
    }
}

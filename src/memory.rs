use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::admin::{normalize_email, AdminList};
use crate::backend::{
    is_server_timestamp, AuthEvent, AuthService, BlobStore, Credential, Document, DocumentStore,
    Identity, PageCursor, Query, SnapshotEvent, StoreError, Subscription,
};

const DOC_ID_LEN: usize = 20;
const UID_LEN: usize = 28;
const HEALTH_COLLECTION: &str = "_health";

/// In-process stand-in for the managed backend, used by the demo and tests.
/// One hub shares auth state, documents, listeners, and blobs so the store's
/// write rules can consult the signed-in identity.
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

pub struct MemoryAuth {
    inner: Arc<Inner>,
}

pub struct MemoryStore {
    inner: Arc<Inner>,
}

pub struct MemoryBlobs {
    inner: Arc<Inner>,
}

struct Inner {
    admins: AdminList,
    state: Mutex<State>,
    next_listener_id: AtomicU64,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Vec<StoredDoc>>,
    listeners: Vec<Listener>,
    accounts: HashMap<String, AccountRecord>,
    current_user: Option<Identity>,
    watchers: Vec<Sender<AuthEvent>>,
    blobs: HashMap<String, BlobRecord>,
    last_ts: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct StoredDoc {
    id: String,
    fields: Map<String, Value>,
}

struct Listener {
    id: u64,
    query: Query,
    tx: Sender<SnapshotEvent>,
}

struct AccountRecord {
    uid: String,
    email: String,
    password: Option<String>,
    display_name: Option<String>,
}

struct BlobRecord {
    content_type: String,
    size: usize,
}

impl MemoryBackend {
    pub fn new(admins: AdminList) -> Self {
        Self {
            inner: Arc::new(Inner {
                admins,
                state: Mutex::new(State::default()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn auth(&self) -> Arc<MemoryAuth> {
        Arc::new(MemoryAuth {
            inner: self.inner.clone(),
        })
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::new(MemoryStore {
            inner: self.inner.clone(),
        })
    }

    pub fn blobs(&self) -> Arc<MemoryBlobs> {
        Arc::new(MemoryBlobs {
            inner: self.inner.clone(),
        })
    }

    /// Registers an account without signing anyone in.
    pub fn seed_account(&self, email: &str, password: &str) {
        let mut state = self.inner.state.lock();
        let key = normalize_email(email);
        state.accounts.entry(key).or_insert_with(|| AccountRecord {
            uid: random_id(UID_LEN),
            email: email.trim().to_string(),
            password: Some(password.to_string()),
            display_name: None,
        });
    }

    /// Metadata for an uploaded blob, keyed by its upload path.
    pub fn blob_info(&self, path: &str) -> Option<(String, usize)> {
        let state = self.inner.state.lock();
        state
            .blobs
            .get(path)
            .map(|blob| (blob.content_type.clone(), blob.size))
    }

    /// Inserts a document bypassing write rules; demo/test seeding only.
    pub fn seed_document(&self, collection: &str, fields: Map<String, Value>) -> String {
        let mut state = self.inner.state.lock();
        let now = state.server_now();
        let fields = resolve_sentinels(fields, now);
        let id = random_id(DOC_ID_LEN);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(StoredDoc {
                id: id.clone(),
                fields,
            });
        state.fan_out(collection);
        id
    }
}

impl State {
    /// Server clock: strictly increasing so insertion order and timestamp
    /// order never disagree.
    fn server_now(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_ts {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_ts = Some(now);
        now
    }

    fn fan_out(&mut self, collection: &str) {
        let mut dead = Vec::new();
        for listener in &self.listeners {
            if listener.query.collection != collection {
                continue;
            }
            let docs = run_query(self, &listener.query, None);
            if listener.tx.send(SnapshotEvent::Snapshot(docs)).is_err() {
                dead.push(listener.id);
            }
        }
        if !dead.is_empty() {
            self.listeners.retain(|listener| !dead.contains(&listener.id));
        }
    }

    fn notify_watchers(&mut self, event: AuthEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn sign_in_as(&mut self, identity: Identity) -> Identity {
        self.current_user = Some(identity.clone());
        self.notify_watchers(AuthEvent::SignedIn(identity.clone()));
        identity
    }
}

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn resolve_sentinels(fields: Map<String, Value>, now: DateTime<Utc>) -> Map<String, Value> {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Micros, true);
    fields
        .into_iter()
        .map(|(key, value)| {
            if is_server_timestamp(&value) {
                (key, Value::String(stamp.clone()))
            } else {
                (key, value)
            }
        })
        .collect()
}

fn order_key(fields: &Map<String, Value>, order_by: &str) -> Option<DateTime<Utc>> {
    let raw = fields.get(order_by)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Documents lacking the ordering field are excluded, matching the backend's
/// orderBy semantics. Ties break on id in the direction of the sort.
fn run_query(state: &State, query: &Query, after: Option<&PageCursor>) -> Vec<Document> {
    let Some(docs) = state.collections.get(&query.collection) else {
        return Vec::new();
    };

    let mut ordered: Vec<(DateTime<Utc>, &StoredDoc)> = docs
        .iter()
        .filter_map(|doc| order_key(&doc.fields, &query.order_by).map(|ts| (ts, doc)))
        .collect();

    if query.descending {
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.id.cmp(&a.1.id)));
    } else {
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    }

    if let Some(cursor) = after {
        let cursor_ts = cursor
            .order_value
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        if let Some(cursor_ts) = cursor_ts {
            ordered.retain(|(ts, doc)| {
                if query.descending {
                    *ts < cursor_ts || (*ts == cursor_ts && doc.id < cursor.doc_id)
                } else {
                    *ts > cursor_ts || (*ts == cursor_ts && doc.id > cursor.doc_id)
                }
            });
        }
    }

    if query.limit > 0 {
        ordered.truncate(query.limit);
    }

    ordered
        .into_iter()
        .map(|(_, doc)| Document {
            id: doc.id.clone(),
            fields: doc.fields.clone(),
        })
        .collect()
}

fn split_doc_path(path: &str) -> Result<(&str, &str), StoreError> {
    path.rsplit_once('/')
        .filter(|(collection, id)| !collection.is_empty() && !id.is_empty())
        .ok_or_else(|| StoreError::Malformed(format!("invalid document path: {}", path)))
}

impl Inner {
    fn check_write(&self, state: &State, collection: &str) -> Result<(), StoreError> {
        let user = state
            .current_user
            .as_ref()
            .ok_or_else(|| StoreError::PermissionDenied("sign in required".into()))?;
        if collection == HEALTH_COLLECTION || collection.starts_with("_health/") {
            return Ok(());
        }
        if self.admins.contains(&user.email) {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied(format!(
                "{} may not write to {}",
                user.email, collection
            )))
        }
    }
}

impl AuthService for MemoryAuth {
    fn watch(&self, tx: Sender<AuthEvent>) -> Result<()> {
        let mut state = self.inner.state.lock();
        let event = match &state.current_user {
            Some(identity) => AuthEvent::SignedIn(identity.clone()),
            None => AuthEvent::SignedOut,
        };
        if tx.send(event).is_ok() {
            state.watchers.push(tx);
        }
        Ok(())
    }

    fn sign_in(&self, credential: Credential) -> Result<Identity> {
        let mut state = self.inner.state.lock();
        match credential {
            Credential::Password { email, password } => {
                let key = normalize_email(&email);
                let account = state.accounts.get(&key);
                let matches = account
                    .and_then(|account| account.password.as_deref())
                    .map(|stored| stored == password)
                    .unwrap_or(false);
                if !matches {
                    bail!("auth: invalid email or password");
                }
                let account = state.accounts.get(&key).expect("account present");
                let identity = Identity {
                    uid: account.uid.clone(),
                    email: account.email.clone(),
                    display_name: account.display_name.clone(),
                };
                Ok(state.sign_in_as(identity))
            }
            Credential::Provider {
                email,
                display_name,
            } => {
                if email.trim().is_empty() {
                    bail!("auth: provider sign-in requires an email");
                }
                let key = normalize_email(&email);
                let account = state.accounts.entry(key).or_insert_with(|| AccountRecord {
                    uid: random_id(UID_LEN),
                    email: email.trim().to_string(),
                    password: None,
                    display_name: None,
                });
                if display_name.is_some() {
                    account.display_name = display_name;
                }
                let identity = Identity {
                    uid: account.uid.clone(),
                    email: account.email.clone(),
                    display_name: account.display_name.clone(),
                };
                Ok(state.sign_in_as(identity))
            }
        }
    }

    fn register(&self, email: &str, password: &str) -> Result<Identity> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            bail!("auth: a valid email is required");
        }
        if password.len() < 6 {
            bail!("auth: password must be at least 6 characters");
        }
        let mut state = self.inner.state.lock();
        let key = normalize_email(email);
        if state.accounts.contains_key(&key) {
            bail!("auth: email already registered");
        }
        let record = AccountRecord {
            uid: random_id(UID_LEN),
            email: email.to_string(),
            password: Some(password.to_string()),
            display_name: None,
        };
        let identity = Identity {
            uid: record.uid.clone(),
            email: record.email.clone(),
            display_name: None,
        };
        state.accounts.insert(key, record);
        Ok(state.sign_in_as(identity))
    }

    fn sign_out(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.current_user.take().is_some() {
            state.notify_watchers(AuthEvent::SignedOut);
        }
        Ok(())
    }

    fn current(&self) -> Option<Identity> {
        self.inner.state.lock().current_user.clone()
    }
}

impl DocumentStore for MemoryStore {
    fn subscribe(
        &self,
        query: Query,
        tx: Sender<SnapshotEvent>,
    ) -> Result<Subscription, StoreError> {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        let initial = run_query(&state, &query, None);
        if tx.send(SnapshotEvent::Snapshot(initial)).is_err() {
            return Ok(Subscription::new(|| {}));
        }
        state.listeners.push(Listener { id, query, tx });
        drop(state);

        let inner = self.inner.clone();
        Ok(Subscription::new(move || {
            inner
                .state
                .lock()
                .listeners
                .retain(|listener| listener.id != id);
        }))
    }

    fn fetch_page(
        &self,
        query: &Query,
        after: Option<&PageCursor>,
    ) -> Result<Vec<Document>, StoreError> {
        let state = self.inner.state.lock();
        Ok(run_query(&state, query, after))
    }

    fn create_document(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let mut state = self.inner.state.lock();
        self.inner.check_write(&state, collection)?;
        let now = state.server_now();
        let fields = resolve_sentinels(fields, now);
        let id = random_id(DOC_ID_LEN);
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(StoredDoc {
                id: id.clone(),
                fields,
            });
        state.fan_out(collection);
        Ok(id)
    }

    fn fetch_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let (collection, doc_id) = split_doc_path(path)?;
        let state = self.inner.state.lock();
        let found = state
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| doc.id == doc_id))
            .map(|doc| Document {
                id: doc.id.clone(),
                fields: doc.fields.clone(),
            });
        Ok(found)
    }

    fn upsert_document(
        &self,
        path: &str,
        fields: Map<String, Value>,
        merge: bool,
    ) -> Result<(), StoreError> {
        let (collection, doc_id) = split_doc_path(path)?;
        let mut state = self.inner.state.lock();
        self.inner.check_write(&state, collection)?;
        let now = state.server_now();
        let fields = resolve_sentinels(fields, now);

        let docs = state.collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|doc| doc.id == doc_id) {
            Some(existing) if merge => {
                for (key, value) in fields {
                    existing.fields.insert(key, value);
                }
            }
            Some(existing) => {
                existing.fields = fields;
            }
            None => {
                docs.push(StoredDoc {
                    id: doc_id.to_string(),
                    fields,
                });
            }
        }
        let collection = collection.to_string();
        state.fan_out(&collection);
        Ok(())
    }
}

impl BlobStore for MemoryBlobs {
    fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StoreError> {
        if path.trim().is_empty() {
            return Err(StoreError::Malformed("empty blob path".into()));
        }
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let token = hex::encode(hasher.finalize());
        let object = utf8_percent_encode(path, NON_ALPHANUMERIC).to_string();
        let url = format!(
            "https://storage.mural.local/v0/b/mural/o/{}?alt=media&token={}",
            object,
            &token[..16]
        );

        let mut state = self.inner.state.lock();
        state.blobs.insert(
            path.to_string(),
            BlobRecord {
                content_type: content_type.to_string(),
                size: bytes.len(),
            },
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{server_timestamp, POSTS_COLLECTION};
    use crossbeam_channel::unbounded;
    use serde_json::json;

    fn admin_backend() -> MemoryBackend {
        let backend = MemoryBackend::new(AdminList::new(["admin@example.com"]));
        backend.seed_account("admin@example.com", "secret1");
        backend
    }

    fn sign_in_admin(backend: &MemoryBackend) -> Identity {
        backend
            .auth()
            .sign_in(Credential::Password {
                email: "admin@example.com".into(),
                password: "secret1".into(),
            })
            .unwrap()
    }

    fn post_fields(text: &str) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("authorUid".into(), json!("u1"));
        fields.insert("authorEmail".into(), json!("admin@example.com"));
        fields.insert("text".into(), json!(text));
        fields.insert("createdAt".into(), server_timestamp());
        fields
    }

    #[test]
    fn create_requires_sign_in() {
        let backend = admin_backend();
        let err = backend
            .store()
            .create_document(POSTS_COLLECTION, post_fields("hi"))
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[test]
    fn create_requires_admin() {
        let backend = admin_backend();
        backend
            .auth()
            .register("visitor@example.com", "secret1")
            .unwrap();
        let err = backend
            .store()
            .create_document(POSTS_COLLECTION, post_fields("hi"))
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[test]
    fn health_ping_allows_any_signed_in_user() {
        let backend = admin_backend();
        backend
            .auth()
            .register("visitor@example.com", "secret1")
            .unwrap();
        let mut fields = Map::new();
        fields.insert("at".into(), server_timestamp());
        fields.insert("by".into(), json!("visitor@example.com"));
        backend
            .store()
            .upsert_document("_health/ping", fields, true)
            .unwrap();
    }

    #[test]
    fn timestamps_strictly_increase() {
        let backend = admin_backend();
        sign_in_admin(&backend);
        let store = backend.store();
        store
            .create_document(POSTS_COLLECTION, post_fields("first"))
            .unwrap();
        store
            .create_document(POSTS_COLLECTION, post_fields("second"))
            .unwrap();

        let query = Query::newest(POSTS_COLLECTION, 10);
        let docs = store.fetch_page(&query, None).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].str_field("text"), Some("second"));
        let newer = docs[0].time_field("createdAt").unwrap();
        let older = docs[1].time_field("createdAt").unwrap();
        assert!(newer > older);
    }

    #[test]
    fn subscribe_delivers_initial_and_subsequent_snapshots() {
        let backend = admin_backend();
        sign_in_admin(&backend);
        let store = backend.store();
        store
            .create_document(POSTS_COLLECTION, post_fields("first"))
            .unwrap();

        let (tx, rx) = unbounded();
        let _sub = store.subscribe(Query::newest(POSTS_COLLECTION, 10), tx).unwrap();

        match rx.try_recv().unwrap() {
            SnapshotEvent::Snapshot(docs) => assert_eq!(docs.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }

        store
            .create_document(POSTS_COLLECTION, post_fields("second"))
            .unwrap();
        match rx.try_recv().unwrap() {
            SnapshotEvent::Snapshot(docs) => {
                assert_eq!(docs.len(), 2);
                assert_eq!(docs[0].str_field("text"), Some("second"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let backend = admin_backend();
        sign_in_admin(&backend);
        let store = backend.store();

        let (tx, rx) = unbounded();
        let sub = store.subscribe(Query::newest(POSTS_COLLECTION, 10), tx).unwrap();
        let _ = rx.try_recv();
        drop(sub);

        store
            .create_document(POSTS_COLLECTION, post_fields("after-drop"))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pages_never_overlap() {
        let backend = admin_backend();
        sign_in_admin(&backend);
        let store = backend.store();
        for n in 0..25 {
            store
                .create_document(POSTS_COLLECTION, post_fields(&format!("post {}", n)))
                .unwrap();
        }

        let query = Query::newest(POSTS_COLLECTION, 10);
        let first = store.fetch_page(&query, None).unwrap();
        assert_eq!(first.len(), 10);

        let cursor = PageCursor::after(first.last().unwrap(), "createdAt").unwrap();
        let second = store.fetch_page(&query, Some(&cursor)).unwrap();
        assert_eq!(second.len(), 10);

        let first_ids: Vec<_> = first.iter().map(|doc| doc.id.clone()).collect();
        assert!(second.iter().all(|doc| !first_ids.contains(&doc.id)));

        let cursor = PageCursor::after(second.last().unwrap(), "createdAt").unwrap();
        let third = store.fetch_page(&query, Some(&cursor)).unwrap();
        assert_eq!(third.len(), 5);
    }

    #[test]
    fn documents_without_order_field_are_excluded() {
        let backend = admin_backend();
        sign_in_admin(&backend);
        let store = backend.store();
        store
            .create_document(POSTS_COLLECTION, post_fields("real post"))
            .unwrap();

        let mut current = Map::new();
        current.insert("url".into(), json!("https://youtu.be/dQw4w9WgXcQ"));
        current.insert("updatedAt".into(), server_timestamp());
        store
            .upsert_document("posts/current", current, true)
            .unwrap();

        let docs = store
            .fetch_page(&Query::newest(POSTS_COLLECTION, 10), None)
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].str_field("text"), Some("real post"));

        let spotlight = store.fetch_document("posts/current").unwrap().unwrap();
        assert_eq!(
            spotlight.str_field("url"),
            Some("https://youtu.be/dQw4w9WgXcQ")
        );
    }

    #[test]
    fn merge_upsert_keeps_unnamed_fields() {
        let backend = admin_backend();
        sign_in_admin(&backend);
        let store = backend.store();

        let mut fields = Map::new();
        fields.insert("url".into(), json!("https://youtu.be/one"));
        fields.insert("author".into(), json!("admin@example.com"));
        store.upsert_document("posts/current", fields, true).unwrap();

        let mut update = Map::new();
        update.insert("url".into(), json!("https://youtu.be/two"));
        store.upsert_document("posts/current", update, true).unwrap();

        let doc = store.fetch_document("posts/current").unwrap().unwrap();
        assert_eq!(doc.str_field("url"), Some("https://youtu.be/two"));
        assert_eq!(doc.str_field("author"), Some("admin@example.com"));
    }

    #[test]
    fn auth_watcher_sees_sign_in_and_out() {
        let backend = admin_backend();
        let auth = backend.auth();

        let (tx, rx) = unbounded();
        auth.watch(tx).unwrap();
        assert_eq!(rx.try_recv().unwrap(), AuthEvent::SignedOut);

        let identity = sign_in_admin(&backend);
        assert_eq!(rx.try_recv().unwrap(), AuthEvent::SignedIn(identity));

        auth.sign_out().unwrap();
        assert_eq!(rx.try_recv().unwrap(), AuthEvent::SignedOut);
        assert!(auth.current().is_none());
    }

    #[test]
    fn register_rejects_duplicates_and_weak_passwords() {
        let backend = admin_backend();
        let auth = backend.auth();
        assert!(auth.register("admin@example.com", "secret1").is_err());
        assert!(auth.register("new@example.com", "short").is_err());
        let identity = auth.register("new@example.com", "longenough").unwrap();
        assert_eq!(identity.email, "new@example.com");
        assert_eq!(auth.current(), Some(identity));
    }

    #[test]
    fn provider_sign_in_creates_account() {
        let backend = admin_backend();
        let auth = backend.auth();
        let identity = auth
            .sign_in(Credential::Provider {
                email: "Guest@Example.com".into(),
                display_name: Some("Guest".into()),
            })
            .unwrap();
        assert_eq!(identity.display_name.as_deref(), Some("Guest"));
        assert_eq!(identity.uid.len(), UID_LEN);
    }

    #[test]
    fn blob_upload_returns_encoded_url() {
        let backend = admin_backend();
        let url = backend
            .blobs()
            .upload("uploads/u1/12_photo.png", b"bytes", "image/png")
            .unwrap();
        assert!(url.contains("uploads%2Fu1%2F12%5Fphoto%2Epng"));
        assert!(url.contains("alt=media"));
    }

    #[test]
    fn blob_upload_records_type_and_size() {
        let backend = admin_backend();
        backend
            .blobs()
            .upload("uploads/u1/12_photo.png", b"bytes", "image/png")
            .unwrap();
        let (content_type, size) = backend.blob_info("uploads/u1/12_photo.png").unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(size, 5);
        assert!(backend.blob_info("uploads/u1/other.png").is_none());
    }
}

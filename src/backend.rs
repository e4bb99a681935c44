use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const POSTS_COLLECTION: &str = "posts";
pub const CURRENT_VIDEO_PATH: &str = "posts/current";
pub const HEALTH_PATH: &str = "_health/ping";

pub const CREATED_AT_FIELD: &str = "createdAt";
pub const SERVER_TIMESTAMP_SENTINEL: &str = "__serverTimestamp";

pub fn comments_collection(post_id: &str) -> String {
    format!("{}/{}/comments", POSTS_COLLECTION, post_id)
}

/// Field value resolved to the server clock at write time.
pub fn server_timestamp() -> Value {
    json!({ SERVER_TIMESTAMP_SENTINEL: true })
}

pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .get(SERVER_TIMESTAMP_SENTINEL)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn label(&self) -> String {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => format!("{} ({})", name, self.email),
            _ => self.email.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Credential {
    Password {
        email: String,
        password: String,
    },
    /// Popup-provider sign-in; the provider vouches for the email.
    Provider {
        email: String,
        display_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Identity),
    SignedOut,
}

pub trait AuthService: Send + Sync {
    /// Registers a watcher. The current state is delivered immediately,
    /// followed by every subsequent change.
    fn watch(&self, tx: Sender<AuthEvent>) -> Result<()>;
    fn sign_in(&self, credential: Credential) -> Result<Identity>;
    fn register(&self, email: &str, password: &str) -> Result<Identity>;
    fn sign_out(&self) -> Result<()>;
    fn current(&self) -> Option<Identity>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn time_field(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.str_field(name)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub collection: String,
    pub order_by: String,
    pub descending: bool,
    pub limit: usize,
}

impl Query {
    /// Most recent documents first, ordered by creation time.
    pub fn newest(collection: impl Into<String>, limit: usize) -> Self {
        Self {
            collection: collection.into(),
            order_by: CREATED_AT_FIELD.to_string(),
            descending: true,
            limit,
        }
    }
}

/// Opaque position marker: the order-key value and id of the document the
/// next page starts strictly after.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor {
    pub(crate) order_value: Value,
    pub(crate) doc_id: String,
}

impl PageCursor {
    /// None when the document lacks the ordering field.
    pub fn after(doc: &Document, order_by: &str) -> Option<Self> {
        let order_value = doc.fields.get(order_by)?.clone();
        Some(Self {
            order_value,
            doc_id: doc.id.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    Snapshot(Vec<Document>),
    Error(StoreError),
}

/// Standing listener handle; dropping it releases the backend listener.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

pub trait DocumentStore: Send + Sync {
    /// Snapshot stream: the current result set is delivered on subscribe and
    /// after every relevant write. Failures arrive as `SnapshotEvent::Error`,
    /// never as a panic on the delivery thread.
    fn subscribe(
        &self,
        query: Query,
        tx: Sender<SnapshotEvent>,
    ) -> Result<Subscription, StoreError>;

    /// One-shot batch strictly after `after` in query order.
    fn fetch_page(
        &self,
        query: &Query,
        after: Option<&PageCursor>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Creates a document with a backend-assigned id; returns the id.
    fn create_document(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, StoreError>;

    fn fetch_document(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// `merge` keeps fields the payload does not name.
    fn upsert_document(
        &self,
        path: &str,
        fields: Map<String, Value>,
        merge: bool,
    ) -> Result<(), StoreError>;
}

pub trait BlobStore: Send + Sync {
    fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default)]
    pub author_uid: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Post {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(doc.fields.clone()))
            .map_err(|err| StoreError::Malformed(format!("post {}: {}", doc.id, err)))
    }

    pub fn into_fields(self) -> Map<String, Value> {
        match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty)
            && self.youtube_id.is_none()
            && self.video_url.is_none()
            && self.image_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub author_uid: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(doc.fields.clone()))
            .map_err(|err| StoreError::Malformed(format!("comment {}: {}", doc.id, err)))
    }

    pub fn into_fields(self) -> Map<String, Value> {
        match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty)
            && self.image_url.is_none()
            && self.video_url.is_none()
    }
}

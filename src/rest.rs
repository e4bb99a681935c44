use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::{distributions::Alphanumeric, Rng};
use reqwest::blocking::Client as HttpClient;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::backend::{
    is_server_timestamp, AuthEvent, AuthService, BlobStore, Credential, Document, DocumentStore,
    Identity, PageCursor, Query, SnapshotEvent, StoreError, Subscription,
};
use crate::feed::debug_log;

const DOC_ID_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub project_id: String,
    pub api_key: String,
    pub identity_url: String,
    pub firestore_url: String,
    pub storage_url: String,
    pub poll_interval: Duration,
    pub http_client: Option<HttpClient>,
}

/// Blocking adapter for the managed service's public HTTP APIs. Realtime
/// subscriptions are realized as a polling thread per listener; every poll
/// result is delivered as a full snapshot, which the synchronizer dedups.
pub struct RestBackend {
    inner: Arc<Inner>,
}

pub struct RestAuth {
    inner: Arc<Inner>,
}

pub struct RestStore {
    inner: Arc<Inner>,
}

pub struct RestBlobs {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: RestConfig,
    http: HttpClient,
    state: Mutex<AuthState>,
}

#[derive(Default)]
struct AuthState {
    current: Option<Identity>,
    id_token: Option<String>,
    watchers: Vec<Sender<AuthEvent>>,
}

impl RestBackend {
    pub fn new(cfg: RestConfig) -> Result<Self> {
        if cfg.project_id.trim().is_empty() {
            bail!("rest: backend.project_id is required");
        }
        if cfg.api_key.trim().is_empty() {
            bail!("rest: backend.api_key is required");
        }
        let http = match cfg.http_client.clone() {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .context("rest: build http client")?,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                http,
                state: Mutex::new(AuthState::default()),
            }),
        })
    }

    pub fn auth(&self) -> Arc<RestAuth> {
        Arc::new(RestAuth {
            inner: self.inner.clone(),
        })
    }

    pub fn store(&self) -> Arc<RestStore> {
        Arc::new(RestStore {
            inner: self.inner.clone(),
        })
    }

    pub fn blobs(&self) -> Arc<RestBlobs> {
        Arc::new(RestBlobs {
            inner: self.inner.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    #[serde(rename = "localId")]
    local_id: String,
    #[serde(default)]
    email: String,
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "idToken")]
    id_token: String,
}

impl Inner {
    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/(default)/documents",
            self.cfg.project_id
        )
    }

    fn doc_name(&self, path: &str) -> String {
        format!("{}/{}", self.documents_root(), path)
    }

    fn bearer(&self) -> Option<String> {
        self.state.lock().id_token.clone()
    }

    fn identity_request(&self, endpoint: &str, body: Value) -> Result<SignInResponse> {
        let url = format!(
            "{}/{}?key={}",
            self.cfg.identity_url.trim_end_matches('/'),
            endpoint,
            self.cfg.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .context("auth: request failed")?;
        let status = response.status();
        if !status.is_success() {
            let detail = auth_error_message(&response.text().unwrap_or_default());
            bail!("auth: {} ({})", detail, status.as_u16());
        }
        response.json().context("auth: decode response")
    }

    fn complete_sign_in(&self, response: SignInResponse) -> Identity {
        let identity = Identity {
            uid: response.local_id,
            email: response.email,
            display_name: response
                .display_name
                .filter(|name| !name.trim().is_empty()),
        };
        let mut state = self.state.lock();
        state.current = Some(identity.clone());
        state.id_token = Some(response.id_token);
        let event = AuthEvent::SignedIn(identity.clone());
        state.watchers.retain(|tx| tx.send(event.clone()).is_ok());
        identity
    }

    fn firestore_post(&self, url: &str, body: &Value) -> Result<Value, StoreError> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = self.bearer() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        check_status(response.status(), url)?;
        response
            .json()
            .map_err(|err| StoreError::Malformed(err.to_string()))
    }
}

fn auth_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "sign-in rejected".to_string())
}

fn check_status(status: StatusCode, url: &str) -> Result<(), StoreError> {
    if status.is_success() {
        return Ok(());
    }
    let detail = format!("{} for {}", status.as_u16(), url);
    match status.as_u16() {
        401 | 403 => Err(StoreError::PermissionDenied(detail)),
        400 | 404 | 409 => Err(StoreError::Malformed(detail)),
        _ => Err(StoreError::Unavailable(detail)),
    }
}

/// JSON field value to the wire's typed value representation.
fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(flag) => json!({ "booleanValue": flag }),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                json!({ "integerValue": int.to_string() })
            } else {
                json!({ "doubleValue": number.as_f64() })
            }
        }
        Value::String(text) => json!({ "stringValue": text }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({
            "mapValue": { "fields": encode_fields_plain(map) }
        }),
    }
}

fn encode_fields_plain(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect()
}

/// Typed wire value back to a plain JSON value. Timestamps come back as
/// RFC 3339 strings, matching what the memory backend stores.
fn decode_value(value: &Value) -> Value {
    let Some(map) = value.as_object() else {
        return Value::Null;
    };
    if let Some(text) = map.get("stringValue").and_then(Value::as_str) {
        return Value::String(text.to_string());
    }
    if let Some(stamp) = map.get("timestampValue").and_then(Value::as_str) {
        return Value::String(stamp.to_string());
    }
    if let Some(int) = map.get("integerValue").and_then(Value::as_str) {
        if let Ok(parsed) = int.parse::<i64>() {
            return json!(parsed);
        }
    }
    if let Some(double) = map.get("doubleValue") {
        return double.clone();
    }
    if let Some(flag) = map.get("booleanValue").and_then(Value::as_bool) {
        return Value::Bool(flag);
    }
    if let Some(items) = value.pointer("/arrayValue/values").and_then(Value::as_array) {
        return Value::Array(items.iter().map(decode_value).collect());
    }
    if let Some(fields) = value.pointer("/mapValue/fields").and_then(Value::as_object) {
        return Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), decode_value(value)))
                .collect(),
        );
    }
    Value::Null
}

fn decode_document(doc: &Value) -> Result<Document, StoreError> {
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Malformed("document without name".into()))?;
    let id = name
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let fields = doc
        .get("fields")
        .and_then(Value::as_object)
        .map(|fields| {
            fields
                .iter()
                .map(|(key, value)| (key.clone(), decode_value(value)))
                .collect()
        })
        .unwrap_or_default();
    Ok(Document { id, fields })
}

/// Splits pending fields into plain values and server-timestamp transforms.
fn split_transforms(fields: Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let mut plain = Map::new();
    let mut transforms = Vec::new();
    for (key, value) in fields {
        if is_server_timestamp(&value) {
            transforms.push(key);
        } else {
            plain.insert(key, value);
        }
    }
    (plain, transforms)
}

/// `collection` may be nested ("posts/abc/comments"); the parent document
/// path goes into the query endpoint, the leaf becomes the collection id.
fn split_collection(collection: &str) -> (Option<&str>, &str) {
    match collection.rsplit_once('/') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, collection),
    }
}

fn structured_query(
    query: &Query,
    after: Option<&PageCursor>,
    documents_root: &str,
    parent: Option<&str>,
) -> Value {
    let (_, leaf) = split_collection(&query.collection);
    let direction = if query.descending {
        "DESCENDING"
    } else {
        "ASCENDING"
    };
    let mut structured = json!({
        "from": [{ "collectionId": leaf }],
        "orderBy": [
            { "field": { "fieldPath": query.order_by }, "direction": direction },
            { "field": { "fieldPath": "__name__" }, "direction": direction },
        ],
        "limit": query.limit,
    });
    if let Some(cursor) = after {
        let doc_path = match parent {
            Some(parent) => format!("{}/{}/{}/{}", documents_root, parent, leaf, cursor.doc_id),
            None => format!("{}/{}/{}", documents_root, leaf, cursor.doc_id),
        };
        let order_value = match cursor.order_value.as_str() {
            Some(stamp) => json!({ "timestampValue": stamp }),
            None => encode_value(&cursor.order_value),
        };
        structured["startAt"] = json!({
            "values": [order_value, { "referenceValue": doc_path }],
            "before": false,
        });
    }
    structured
}

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl AuthService for RestAuth {
    fn watch(&self, tx: Sender<AuthEvent>) -> Result<()> {
        let mut state = self.inner.state.lock();
        let event = match &state.current {
            Some(identity) => AuthEvent::SignedIn(identity.clone()),
            None => AuthEvent::SignedOut,
        };
        if tx.send(event).is_ok() {
            state.watchers.push(tx);
        }
        Ok(())
    }

    fn sign_in(&self, credential: Credential) -> Result<Identity> {
        match credential {
            Credential::Password { email, password } => {
                let response = self.inner.identity_request(
                    "accounts:signInWithPassword",
                    json!({
                        "email": email.trim(),
                        "password": password,
                        "returnSecureToken": true,
                    }),
                )?;
                Ok(self.inner.complete_sign_in(response))
            }
            Credential::Provider { .. } => {
                bail!("auth: provider sign-in requires the hosted page, use email and password")
            }
        }
    }

    fn register(&self, email: &str, password: &str) -> Result<Identity> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            bail!("auth: a valid email is required");
        }
        let response = self.inner.identity_request(
            "accounts:signUp",
            json!({
                "email": email,
                "password": password,
                "returnSecureToken": true,
            }),
        )?;
        Ok(self.inner.complete_sign_in(response))
    }

    fn sign_out(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.current.take().is_some() {
            state.id_token = None;
            state
                .watchers
                .retain(|tx| tx.send(AuthEvent::SignedOut).is_ok());
        }
        Ok(())
    }

    fn current(&self) -> Option<Identity> {
        self.inner.state.lock().current.clone()
    }
}

impl RestStore {
    fn run_query(
        &self,
        query: &Query,
        after: Option<&PageCursor>,
    ) -> Result<Vec<Document>, StoreError> {
        let inner = &self.inner;
        let root = inner.documents_root();
        let (parent, _) = split_collection(&query.collection);
        let endpoint = match parent {
            Some(parent) => format!(
                "{}/{}/{}:runQuery",
                inner.cfg.firestore_url.trim_end_matches('/'),
                root,
                parent
            ),
            None => format!(
                "{}/{}:runQuery",
                inner.cfg.firestore_url.trim_end_matches('/'),
                root
            ),
        };
        let body = json!({ "structuredQuery": structured_query(query, after, &root, parent) });
        let response = inner.firestore_post(&endpoint, &body)?;

        let rows = response
            .as_array()
            .ok_or_else(|| StoreError::Malformed("runQuery did not return rows".into()))?;
        let mut docs = Vec::new();
        for row in rows {
            if let Some(doc) = row.get("document") {
                docs.push(decode_document(doc)?);
            }
        }
        Ok(docs)
    }
}

impl DocumentStore for RestStore {
    fn subscribe(
        &self,
        query: Query,
        tx: Sender<SnapshotEvent>,
    ) -> Result<Subscription, StoreError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let store = RestStore {
            inner: self.inner.clone(),
        };
        let interval = self.inner.cfg.poll_interval;
        let flag = cancelled.clone();
        thread::spawn(move || loop {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            let event = match store.run_query(&query, None) {
                Ok(docs) => SnapshotEvent::Snapshot(docs),
                Err(err) => SnapshotEvent::Error(err),
            };
            if tx.send(event).is_err() {
                break;
            }
            thread::park_timeout(interval);
        });
        debug_log("rest: polling subscription started");
        Ok(Subscription::new(move || {
            cancelled.store(true, Ordering::SeqCst);
        }))
    }

    fn fetch_page(
        &self,
        query: &Query,
        after: Option<&PageCursor>,
    ) -> Result<Vec<Document>, StoreError> {
        self.run_query(query, after)
    }

    fn create_document(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let inner = &self.inner;
        let id = random_id(DOC_ID_LEN);
        let name = inner.doc_name(&format!("{}/{}", collection, id));
        let (plain, transforms) = split_transforms(fields);

        let mut write = json!({
            "update": { "name": name, "fields": encode_fields_plain(&plain) },
            "currentDocument": { "exists": false },
        });
        if !transforms.is_empty() {
            write["updateTransforms"] = transforms
                .iter()
                .map(|path| json!({ "fieldPath": path, "setToServerValue": "REQUEST_TIME" }))
                .collect();
        }

        let endpoint = format!(
            "{}/{}:commit",
            inner.cfg.firestore_url.trim_end_matches('/'),
            inner.documents_root()
        );
        inner.firestore_post(&endpoint, &json!({ "writes": [write] }))?;
        Ok(id)
    }

    fn fetch_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let inner = &self.inner;
        let url = format!(
            "{}/{}",
            inner.cfg.firestore_url.trim_end_matches('/'),
            inner.doc_name(path)
        );
        let mut request = inner.http.get(&url);
        if let Some(token) = inner.bearer() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response.status(), &url)?;
        let body: Value = response
            .json()
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(Some(decode_document(&body)?))
    }

    fn upsert_document(
        &self,
        path: &str,
        fields: Map<String, Value>,
        merge: bool,
    ) -> Result<(), StoreError> {
        let inner = &self.inner;
        let name = inner.doc_name(path);
        let (plain, transforms) = split_transforms(fields);

        let mut write = json!({
            "update": { "name": name, "fields": encode_fields_plain(&plain) },
        });
        if merge {
            write["updateMask"] = json!({
                "fieldPaths": plain.keys().cloned().collect::<Vec<_>>()
            });
        }
        if !transforms.is_empty() {
            write["updateTransforms"] = transforms
                .iter()
                .map(|field| json!({ "fieldPath": field, "setToServerValue": "REQUEST_TIME" }))
                .collect();
        }

        let endpoint = format!(
            "{}/{}:commit",
            inner.cfg.firestore_url.trim_end_matches('/'),
            inner.documents_root()
        );
        inner.firestore_post(&endpoint, &json!({ "writes": [write] }))?;
        Ok(())
    }
}

impl BlobStore for RestBlobs {
    fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, StoreError> {
        let inner = &self.inner;
        let bucket = format!("{}.appspot.com", inner.cfg.project_id);
        let upload_url = format!(
            "{}/b/{}/o?uploadType=media&name={}",
            inner.cfg.storage_url.trim_end_matches('/'),
            bucket,
            utf8_percent_encode(path, NON_ALPHANUMERIC)
        );
        let mut request = inner
            .http
            .post(&upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec());
        if let Some(token) = inner.bearer() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        check_status(response.status(), &upload_url)?;
        let body: Value = response
            .json()
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        let token = body
            .get("downloadTokens")
            .and_then(Value::as_str)
            .map(|tokens| tokens.split(',').next().unwrap_or(tokens).to_string());

        let mut url = format!(
            "{}/b/{}/o/{}?alt=media",
            inner.cfg.storage_url.trim_end_matches('/'),
            bucket,
            utf8_percent_encode(path, NON_ALPHANUMERIC)
        );
        if let Some(token) = token {
            url.push_str("&token=");
            url.push_str(&token);
        }
        Ok(url)
    }
}

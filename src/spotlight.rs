use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map};

use crate::admin::AdminList;
use crate::backend::{
    server_timestamp, DocumentStore, Identity, StoreError, CURRENT_VIDEO_PATH,
};
use crate::composer::ComposeError;

/// The single admin-curated "current video" document. It lives inside the
/// posts collection but carries no creation timestamp, so feed queries never
/// return it.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentVideo {
    pub url: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
}

pub struct SpotlightPanel {
    store: Arc<dyn DocumentStore>,
    admins: Arc<AdminList>,
}

impl SpotlightPanel {
    pub fn new(store: Arc<dyn DocumentStore>, admins: Arc<AdminList>) -> Self {
        Self { store, admins }
    }

    /// One-shot read. An absent document or a document without a `url`
    /// renders as an empty panel.
    pub fn fetch(&self) -> Result<Option<CurrentVideo>, StoreError> {
        let Some(doc) = self.store.fetch_document(CURRENT_VIDEO_PATH)? else {
            return Ok(None);
        };
        let Some(url) = doc.str_field("url") else {
            return Ok(None);
        };
        Ok(Some(CurrentVideo {
            url: url.to_string(),
            updated_at: doc.time_field("updatedAt"),
            author: doc.str_field("author").map(str::to_string),
        }))
    }

    /// Admin-gated merge write; fields the payload does not name survive.
    pub fn set(&self, identity: Option<&Identity>, url: &str) -> Result<(), ComposeError> {
        let identity = identity.ok_or(ComposeError::SignedOut)?;
        if !self.admins.contains(&identity.email) {
            return Err(ComposeError::NotAdmin);
        }
        let url = url.trim();
        if url.is_empty() {
            return Err(ComposeError::Empty);
        }

        let mut fields = Map::new();
        fields.insert("url".into(), json!(url));
        fields.insert("updatedAt".into(), server_timestamp());
        fields.insert("author".into(), json!(identity.email));
        self.store
            .upsert_document(CURRENT_VIDEO_PATH, fields, true)
            .map_err(ComposeError::Store)
    }
}

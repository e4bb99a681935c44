use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};

use crate::backend::{comments_collection, Comment, DocumentStore, Query, SnapshotEvent};
use crate::feed::debug_log;

/// Live comment list for the currently selected post. The window is small
/// and fully replaced on every snapshot, so no merge bookkeeping is needed;
/// at most one subscription is active, and switching posts replaces the
/// channel so a late snapshot from the old post can never land here.
pub struct CommentPanel {
    store: Arc<dyn DocumentStore>,
    limit: usize,
    selected: Option<String>,
    snapshot_rx: Option<Receiver<SnapshotEvent>>,
    subscription: Option<crate::backend::Subscription>,
    comments: Vec<Comment>,
    status: Option<String>,
}

impl CommentPanel {
    pub fn new(store: Arc<dyn DocumentStore>, limit: usize) -> Self {
        Self {
            store,
            limit,
            selected: None,
            snapshot_rx: None,
            subscription: None,
            comments: Vec::new(),
            status: None,
        }
    }

    pub fn selected_post(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Subscribes to the comments of `post_id`, releasing any previous
    /// subscription first.
    pub fn open(&mut self, post_id: &str) {
        self.close();
        self.selected = Some(post_id.to_string());

        let (tx, rx) = unbounded();
        let query = Query::newest(comments_collection(post_id), self.limit);
        match self.store.subscribe(query, tx) {
            Ok(subscription) => {
                self.snapshot_rx = Some(rx);
                self.subscription = Some(subscription);
                debug_log(format!("comments: opened {}", post_id));
            }
            Err(err) => {
                self.status = Some(format!("Comments unavailable: {}", err));
            }
        }
    }

    /// Releases the subscription and clears the panel. Idempotent.
    pub fn close(&mut self) {
        self.subscription = None;
        self.snapshot_rx = None;
        self.selected = None;
        self.comments.clear();
        self.status = None;
    }

    /// Drains pending snapshots; the newest full result set wins. Returns
    /// true when the panel changed.
    pub fn pump(&mut self) -> bool {
        let Some(rx) = self.snapshot_rx.clone() else {
            return false;
        };
        let mut changed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SnapshotEvent::Snapshot(docs) => {
                    self.comments = docs
                        .iter()
                        .filter_map(|doc| match Comment::from_document(doc) {
                            Ok(comment) => Some(comment),
                            Err(err) => {
                                debug_log(format!("comments: skipping {}: {}", doc.id, err));
                                None
                            }
                        })
                        .collect();
                    self.status = None;
                }
                SnapshotEvent::Error(err) => {
                    self.status = Some(format!("Comments stalled: {}", err));
                }
            }
            changed = true;
        }
        changed
    }
}

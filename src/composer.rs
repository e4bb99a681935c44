use std::sync::Arc;

use chrono::Utc;

use crate::admin::AdminList;
use crate::backend::{
    comments_collection, server_timestamp, BlobStore, Comment, DocumentStore, Identity, Post,
    StoreError, POSTS_COLLECTION,
};
use crate::media::{self, Media, UploadKind};

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("sign in to publish")]
    SignedOut,
    #[error("only administrators can publish")]
    NotAdmin,
    #[error("write something, provide a valid URL or attach a file")]
    Empty,
    #[error("upload failed: {0}")]
    Upload(StoreError),
    #[error("publish failed: {0}")]
    Store(StoreError),
}

/// A file the user attached to a post or comment.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Attachment {
    fn resolved_type(&self) -> String {
        match self.content_type.as_deref() {
            Some(declared) if !declared.trim().is_empty() => declared.trim().to_string(),
            _ => media::detect_mime(&self.bytes),
        }
    }
}

/// Builds and submits posts and comments. Validation happens before any
/// network call; on success exactly one create is issued and the result is
/// never rendered locally, the live subscription reflects it.
pub struct Composer {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    admins: Arc<AdminList>,
}

impl Composer {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        admins: Arc<AdminList>,
    ) -> Self {
        Self {
            store,
            blobs,
            admins,
        }
    }

    pub fn publish_post(
        &self,
        identity: Option<&Identity>,
        text: &str,
        link: &str,
        attachment: Option<Attachment>,
    ) -> Result<String, ComposeError> {
        let identity = self.require_admin(identity)?;

        let text = text.trim();
        let mut post = Post {
            author_uid: identity.uid.clone(),
            author_email: identity.email.clone(),
            text: (!text.is_empty()).then(|| text.to_string()),
            ..Post::default()
        };

        match media::classify_link(link) {
            Media::Youtube { id } => post.youtube_id = Some(id),
            Media::DirectVideo { url } => post.video_url = Some(url),
            Media::Image { url } => post.image_url = Some(url),
            Media::Plain => {}
        }

        if let Some(attachment) = attachment {
            let (kind, url) = self.upload(identity, "uploads", &attachment)?;
            match kind {
                UploadKind::Image => post.image_url = Some(url),
                UploadKind::Video => post.video_url = Some(url),
                UploadKind::Other => {}
            }
        }

        if post.is_empty() {
            return Err(ComposeError::Empty);
        }

        let mut fields = post.into_fields();
        fields.insert("createdAt".into(), server_timestamp());
        self.store
            .create_document(POSTS_COLLECTION, fields)
            .map_err(ComposeError::Store)
    }

    pub fn send_comment(
        &self,
        identity: Option<&Identity>,
        post_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<String, ComposeError> {
        let identity = self.require_admin(identity)?;

        let text = text.trim();
        let mut comment = Comment {
            author_uid: identity.uid.clone(),
            author_email: identity.email.clone(),
            text: (!text.is_empty()).then(|| text.to_string()),
            ..Comment::default()
        };

        if let Some(attachment) = attachment {
            let (kind, url) = self.upload(identity, "comments", &attachment)?;
            match kind {
                UploadKind::Image => comment.image_url = Some(url),
                UploadKind::Video => comment.video_url = Some(url),
                UploadKind::Other => {}
            }
        }

        if comment.is_empty() {
            return Err(ComposeError::Empty);
        }

        let mut fields = comment.into_fields();
        fields.insert("createdAt".into(), server_timestamp());
        self.store
            .create_document(&comments_collection(post_id), fields)
            .map_err(ComposeError::Store)
    }

    fn require_admin<'a>(
        &self,
        identity: Option<&'a Identity>,
    ) -> Result<&'a Identity, ComposeError> {
        let identity = identity.ok_or(ComposeError::SignedOut)?;
        if !self.admins.contains(&identity.email) {
            return Err(ComposeError::NotAdmin);
        }
        Ok(identity)
    }

    /// Uploads under a path namespaced by uploader and time, mirroring the
    /// blob layout the security rules expect.
    fn upload(
        &self,
        identity: &Identity,
        prefix: &str,
        attachment: &Attachment,
    ) -> Result<(UploadKind, String), ComposeError> {
        let content_type = attachment.resolved_type();
        let path = format!(
            "{}/{}/{}_{}",
            prefix,
            identity.uid,
            Utc::now().timestamp_millis(),
            attachment.filename
        );
        let url = self
            .blobs
            .upload(&path, &attachment.bytes, &content_type)
            .map_err(ComposeError::Upload)?;
        Ok((media::upload_kind(&content_type), url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AuthService, Credential, DocumentStore};
    use crate::memory::MemoryBackend;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    fn setup() -> (MemoryBackend, Composer, Identity) {
        let admins = Arc::new(AdminList::new(["admin@example.com"]));
        let backend = MemoryBackend::new(AdminList::new(["admin@example.com"]));
        backend.seed_account("admin@example.com", "secret1");
        let identity = backend
            .auth()
            .sign_in(Credential::Password {
                email: "admin@example.com".into(),
                password: "secret1".into(),
            })
            .unwrap();
        let composer = Composer::new(backend.store(), backend.blobs(), admins);
        (backend, composer, identity)
    }

    #[test]
    fn empty_post_is_rejected_before_any_write() {
        let (backend, composer, identity) = setup();
        let err = composer
            .publish_post(Some(&identity), "  ", "", None)
            .unwrap_err();
        assert!(matches!(err, ComposeError::Empty));

        let docs = backend
            .store()
            .fetch_page(&crate::backend::Query::newest(POSTS_COLLECTION, 10), None)
            .unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn signed_out_and_non_admin_are_blocked() {
        let (backend, composer, _identity) = setup();
        assert!(matches!(
            composer.publish_post(None, "hello", "", None),
            Err(ComposeError::SignedOut)
        ));

        let visitor = backend
            .auth()
            .register("visitor@example.com", "secret1")
            .unwrap();
        assert!(matches!(
            composer.publish_post(Some(&visitor), "hello", "", None),
            Err(ComposeError::NotAdmin)
        ));
    }

    #[test]
    fn youtube_link_becomes_embed_id() {
        let (backend, composer, identity) = setup();
        let id = composer
            .publish_post(Some(&identity), "", "https://youtu.be/dQw4w9WgXcQ", None)
            .unwrap();

        let doc = backend
            .store()
            .fetch_document(&format!("{}/{}", POSTS_COLLECTION, id))
            .unwrap()
            .unwrap();
        assert_eq!(doc.str_field("youtubeId"), Some("dQw4w9WgXcQ"));
        assert!(doc.str_field("videoUrl").is_none());
    }

    #[test]
    fn mp4_link_becomes_video_url() {
        let (backend, composer, identity) = setup();
        let id = composer
            .publish_post(
                Some(&identity),
                "",
                "https://cdn.example.com/clip.mp4?sig=1",
                None,
            )
            .unwrap();
        let doc = backend
            .store()
            .fetch_document(&format!("{}/{}", POSTS_COLLECTION, id))
            .unwrap()
            .unwrap();
        assert_eq!(
            doc.str_field("videoUrl"),
            Some("https://cdn.example.com/clip.mp4?sig=1")
        );
    }

    #[test]
    fn image_attachment_is_uploaded_and_linked() {
        let (backend, composer, identity) = setup();
        let attachment = Attachment {
            filename: "photo.png".into(),
            content_type: Some("image/png".into()),
            bytes: PNG_MAGIC.to_vec(),
        };
        let id = composer
            .publish_post(Some(&identity), "", "", Some(attachment))
            .unwrap();
        let doc = backend
            .store()
            .fetch_document(&format!("{}/{}", POSTS_COLLECTION, id))
            .unwrap()
            .unwrap();
        let url = doc.str_field("imageUrl").unwrap();
        assert!(url.contains("alt=media"));
    }

    #[test]
    fn undeclared_content_type_is_sniffed() {
        let (backend, composer, identity) = setup();
        let attachment = Attachment {
            filename: "photo".into(),
            content_type: None,
            bytes: PNG_MAGIC.to_vec(),
        };
        let id = composer
            .publish_post(Some(&identity), "", "", Some(attachment))
            .unwrap();
        let doc = backend
            .store()
            .fetch_document(&format!("{}/{}", POSTS_COLLECTION, id))
            .unwrap()
            .unwrap();
        assert!(doc.str_field("imageUrl").is_some());
    }

    #[test]
    fn comment_requires_content() {
        let (_backend, composer, identity) = setup();
        let err = composer
            .send_comment(Some(&identity), "p1", "", None)
            .unwrap_err();
        assert!(matches!(err, ComposeError::Empty));
    }

    #[test]
    fn comment_lands_under_the_post() {
        let (backend, composer, identity) = setup();
        let post_id = composer
            .publish_post(Some(&identity), "a post", "", None)
            .unwrap();
        composer
            .send_comment(Some(&identity), &post_id, "a comment", None)
            .unwrap();

        let docs = backend
            .store()
            .fetch_page(
                &crate::backend::Query::newest(comments_collection(&post_id), 10),
                None,
            )
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].str_field("text"), Some("a comment"));
    }
}

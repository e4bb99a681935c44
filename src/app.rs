use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use tiny_http::{Header, Method, Request, Response, Server};

use crate::admin::AdminList;
use crate::backend::{
    server_timestamp, AuthService, BlobStore, Credential, DocumentStore, StoreError,
    CURRENT_VIDEO_PATH, HEALTH_PATH,
};
use crate::comments::CommentPanel;
use crate::composer::Composer;
use crate::config;
use crate::feed::FeedController;
use crate::memory::MemoryBackend;
use crate::render::{self, PageContext};
use crate::rest::{RestBackend, RestConfig};
use crate::session::SessionController;
use crate::spotlight::SpotlightPanel;

pub struct Services {
    pub auth: Arc<dyn AuthService>,
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Builds the backend trio named by `backend.mode`.
pub fn build_services(cfg: &config::Config, admins: &AdminList) -> Result<Services> {
    match cfg.backend.mode.as_str() {
        "memory" => {
            let backend = MemoryBackend::new(admins.clone());
            Ok(Services {
                auth: backend.auth(),
                store: backend.store(),
                blobs: backend.blobs(),
            })
        }
        "rest" => {
            let backend = RestBackend::new(RestConfig {
                project_id: cfg.backend.project_id.clone(),
                api_key: cfg.backend.api_key.clone(),
                identity_url: cfg.backend.identity_url.clone(),
                firestore_url: cfg.backend.firestore_url.clone(),
                storage_url: cfg.backend.storage_url.clone(),
                poll_interval: cfg.backend.poll_interval,
                http_client: None,
            })?;
            Ok(Services {
                auth: backend.auth(),
                store: backend.store(),
                blobs: backend.blobs(),
            })
        }
        other => bail!("config: unknown backend.mode {:?}", other),
    }
}

pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let admins = AdminList::new(cfg.admins.emails.iter());
    if admins.is_empty() {
        bail!("config: admins.emails must name at least one address");
    }
    let services = build_services(&cfg, &admins)?;
    let mut app = App::new(&cfg, Arc::new(admins), services)?;

    let server = Server::http(&cfg.demo.listen)
        .map_err(|err| anyhow!("demo: listen on {}: {}", cfg.demo.listen, err))?;
    let url = format!("http://{}/", server.server_addr());
    println!("Mural demo listening on {}", url);
    if cfg.demo.open_browser {
        let _ = webbrowser::open(&url);
    }

    for request in server.incoming_requests() {
        app.handle(request)?;
    }
    Ok(())
}

struct App {
    admins: Arc<AdminList>,
    store: Arc<dyn DocumentStore>,
    session: SessionController,
    feed: FeedController,
    comments: CommentPanel,
    composer: Composer,
    spotlight: SpotlightPanel,
    status: Option<String>,
}

impl App {
    fn new(cfg: &config::Config, admins: Arc<AdminList>, services: Services) -> Result<Self> {
        let session = SessionController::new(services.auth.clone(), admins.clone())?;
        let mut feed = FeedController::new(services.store.clone(), cfg.feed.window_size);
        feed.start()?;
        let comments = CommentPanel::new(services.store.clone(), cfg.feed.comment_limit);
        let composer = Composer::new(
            services.store.clone(),
            services.blobs.clone(),
            admins.clone(),
        );
        let spotlight = SpotlightPanel::new(services.store.clone(), admins.clone());
        Ok(Self {
            admins,
            store: services.store,
            session,
            feed,
            comments,
            composer,
            spotlight,
            status: None,
        })
    }

    /// One request = one pump cycle. Identity changes tear the feed session
    /// down and rebuild it before the page is rendered.
    fn pump(&mut self) -> Result<()> {
        if self.session.pump() {
            self.feed.stop();
            self.comments.close();
            self.feed.start()?;
        }
        self.feed.pump();
        self.comments.pump();
        Ok(())
    }

    fn handle(&mut self, mut request: Request) -> Result<()> {
        self.pump()?;

        let url = request.url().to_string();
        let method = request.method().clone();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, query),
            None => (url.as_str(), ""),
        };
        let params = parse_form(query);

        let response = match (method, path) {
            (Method::Get, "/") => self.render_page(),
            (Method::Get, "/older") => {
                self.feed.load_older();
                self.wait_for_page();
                redirect("/")
            }
            (Method::Get, "/comments") => {
                match params.get("post") {
                    Some(post_id) if !post_id.is_empty() => self.comments.open(post_id),
                    _ => self.comments.close(),
                }
                self.comments.pump();
                redirect("/")
            }
            (Method::Get, "/health") => self.render_health(),
            (Method::Post, "/login") => {
                let form = read_form(&mut request)?;
                self.handle_login(&form);
                redirect("/")
            }
            (Method::Post, "/logout") => {
                if let Err(err) = self.session.sign_out() {
                    self.status = Some(format!("Sign-out failed: {}", err));
                }
                redirect("/")
            }
            (Method::Post, "/publish") => {
                let form = read_form(&mut request)?;
                let text = form.get("text").map(String::as_str).unwrap_or("");
                let link = form.get("url").map(String::as_str).unwrap_or("");
                match self
                    .composer
                    .publish_post(self.session.identity(), text, link, None)
                {
                    Ok(_) => self.status = None,
                    Err(err) => self.status = Some(err.to_string()),
                }
                redirect("/")
            }
            (Method::Post, "/comment") => {
                let form = read_form(&mut request)?;
                let post_id = form.get("post").map(String::as_str).unwrap_or("");
                let text = form.get("text").map(String::as_str).unwrap_or("");
                match self
                    .composer
                    .send_comment(self.session.identity(), post_id, text, None)
                {
                    Ok(_) => self.status = None,
                    Err(err) => self.status = Some(err.to_string()),
                }
                redirect("/")
            }
            (Method::Post, "/spotlight") => {
                let form = read_form(&mut request)?;
                let url = form.get("url").map(String::as_str).unwrap_or("");
                match self.spotlight.set(self.session.identity(), url) {
                    Ok(()) => self.status = None,
                    Err(err) => self.status = Some(err.to_string()),
                }
                redirect("/")
            }
            _ => Response::from_string("not found").with_status_code(404),
        };

        request.respond(response).context("demo: respond")?;
        Ok(())
    }

    fn handle_login(&mut self, form: &HashMap<String, String>) {
        let email = form.get("email").map(String::as_str).unwrap_or("");
        let password = form.get("password").map(String::as_str).unwrap_or("");
        let action = form.get("action").map(String::as_str).unwrap_or("login");
        let result = match action {
            "register" => self.session.register(email, password),
            "provider" => self.session.sign_in(Credential::Provider {
                email: email.to_string(),
                display_name: None,
            }),
            _ => self.session.sign_in(Credential::Password {
                email: email.to_string(),
                password: password.to_string(),
            }),
        };
        match result {
            Ok(identity) if !self.admins.contains(&identity.email) => {
                self.status = Some("Signed in without admin rights.".to_string());
            }
            Ok(_) => self.status = None,
            Err(err) => self.status = Some(err.to_string()),
        }
    }

    /// Blocks briefly so the redirect back to `/` shows the appended page.
    fn wait_for_page(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            self.feed.pump();
            if !self.feed.is_loading_older() || Instant::now() > deadline {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn render_page(&mut self) -> Response<std::io::Cursor<Vec<u8>>> {
        let spotlight_html = match self.spotlight.fetch() {
            Ok(video) => render::spotlight_panel(video.as_ref()),
            Err(err) => format!(
                r#"<div class="video-box"><p class="muted">Current video unavailable: {}</p></div>"#,
                render::escape_html(&err.to_string())
            ),
        };

        let posts_html = self
            .feed
            .entries()
            .iter()
            .map(|entry| render::post_card(&entry.id, &entry.post))
            .collect::<Vec<_>>()
            .join("\n");

        let comments_html = self.comments.selected_post().map(|_| {
            self.comments
                .comments()
                .iter()
                .map(render::comment_item)
                .collect::<Vec<_>>()
                .join("\n")
        });

        let status = self
            .status
            .as_deref()
            .or_else(|| self.feed.status())
            .or_else(|| self.comments.status());

        let selected_post = self.comments.selected_post().map(str::to_string);
        let ctx = PageContext {
            who: self.session.identity().map(|identity| identity.label()),
            is_admin: self.session.is_admin(),
            status,
            spotlight_html,
            posts_html,
            comments_html,
            selected_post: selected_post.as_deref(),
            reached_end: self.feed.reached_end(),
        };
        html_response(render::feed_page(&ctx))
    }

    fn render_health(&mut self) -> Response<std::io::Cursor<Vec<u8>>> {
        let report = run_health_checks(self.store.as_ref(), self.session.identity());
        let body = format!(
            "read: {}\nwrite: {}\ncomment write: {}\n",
            verdict(&report.read),
            verdict(&report.write),
            verdict(&report.comment_write),
        );
        Response::from_string(body)
    }
}

struct HealthReport {
    read: Result<(), StoreError>,
    write: Result<(), StoreError>,
    comment_write: Result<(), StoreError>,
}

/// The three probes of the original diagnostics page: a document read, a
/// merge write to the health ping, and a comment create under the current
/// video. Failures are reported, never raised.
fn run_health_checks(
    store: &dyn DocumentStore,
    identity: Option<&crate::backend::Identity>,
) -> HealthReport {
    let by = identity
        .map(|identity| identity.email.clone())
        .unwrap_or_else(|| "(anon)".to_string());

    let read = store.fetch_document(CURRENT_VIDEO_PATH).map(|_| ());

    let mut ping = serde_json::Map::new();
    ping.insert("at".into(), server_timestamp());
    ping.insert("by".into(), serde_json::json!(by));
    let write = store.upsert_document(HEALTH_PATH, ping, true);

    let mut comment = serde_json::Map::new();
    comment.insert("text".into(), serde_json::json!("[health] ping"));
    comment.insert("author".into(), serde_json::json!(by));
    comment.insert("createdAt".into(), server_timestamp());
    let comment_write = store
        .create_document("posts/current/comments", comment)
        .map(|_| ());

    HealthReport {
        read,
        write,
        comment_write,
    }
}

fn verdict(result: &Result<(), StoreError>) -> String {
    match result {
        Ok(()) => "OK".to_string(),
        Err(err) => format!("FAILED ({})", err),
    }
}

fn html_response(body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    let header = Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
        .expect("static header");
    Response::from_string(body).with_header(header)
}

fn redirect(location: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let header =
        Header::from_bytes(&b"Location"[..], location.as_bytes()).expect("static header");
    Response::from_string(String::new())
        .with_status_code(303)
        .with_header(header)
}

fn read_form(request: &mut Request) -> Result<HashMap<String, String>> {
    let mut body = String::new();
    request
        .as_reader()
        .read_to_string(&mut body)
        .context("demo: read request body")?;
    Ok(parse_form(&body))
}

fn parse_form(encoded: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(encoded.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

use chrono::{DateTime, Utc};

use crate::backend::{Comment, Post};
use crate::media;
use crate::spotlight::CurrentVideo;

pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}

pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.unwrap_or_else(Utc::now)
        .format("%d/%m/%Y %H:%M:%S")
        .to_string()
}

pub fn post_card(id: &str, post: &Post) -> String {
    let author = if post.author_email.is_empty() {
        "unknown".to_string()
    } else {
        escape_html(&post.author_email)
    };
    let text = match post.text.as_deref() {
        Some(text) if !text.is_empty() => {
            format!("<p class=\"post-text\">{}</p>", escape_html(text))
        }
        _ => String::new(),
    };
    let id = escape_html(id);

    format!(
        r#"<article class="card post-card" data-id="{id}">
  <header class="post-header">
    <div class="post-author">{author}</div>
    <div class="post-dot">&bull;</div>
    <time class="post-time">{time}</time>
  </header>
  <div class="post-body">
    {text}
    {media}
  </div>
  <footer class="post-footer">
    <a class="btn btn-ghost btn-comments" href="/comments?post={id}">View comments</a>
  </footer>
</article>"#,
        id = id,
        author = author,
        time = format_timestamp(post.created_at),
        text = text,
        media = media_markup(post),
    )
}

fn media_markup(post: &Post) -> String {
    if let Some(id) = post.youtube_id.as_deref() {
        let src = escape_html(&media::embed_url(id));
        return format!(
            r#"<div class="ratio"><iframe src="{src}" title="YouTube" frameborder="0" allow="accelerometer; autoplay; clipboard-write; encrypted-media; gyroscope; picture-in-picture; web-share" allowfullscreen></iframe></div>"#
        );
    }
    if let Some(url) = post.video_url.as_deref() {
        return format!(
            r#"<video class="media" controls preload="metadata"><source src="{}" type="video/mp4" />Your browser does not support video.</video>"#,
            escape_html(url)
        );
    }
    if let Some(url) = post.image_url.as_deref() {
        return format!(r#"<img class="media" src="{}" alt="">"#, escape_html(url));
    }
    String::new()
}

pub fn comment_item(comment: &Comment) -> String {
    let author = if comment.author_email.is_empty() {
        "unknown".to_string()
    } else {
        escape_html(&comment.author_email)
    };
    let text = match comment.text.as_deref() {
        Some(text) if !text.is_empty() => {
            format!("<p class=\"comment-text\">{}</p>", escape_html(text))
        }
        _ => String::new(),
    };
    let media = if let Some(url) = comment.image_url.as_deref() {
        format!(
            r#"<img class="comment-media" src="{}" />"#,
            escape_html(url)
        )
    } else if let Some(url) = comment.video_url.as_deref() {
        format!(
            r#"<video class="comment-media" controls preload="metadata"><source src="{}" type="video/mp4"></video>"#,
            escape_html(url)
        )
    } else {
        String::new()
    };

    format!(
        r#"<div class="comment">
  <header class="comment-head">
    <span class="comment-author">{author}</span>
    <span class="comment-dot">&bull;</span>
    <time class="comment-time">{time}</time>
  </header>
  {text}
  {media}
</div>"#,
        author = author,
        time = format_timestamp(comment.created_at),
        text = text,
        media = media,
    )
}

pub fn spotlight_panel(video: Option<&CurrentVideo>) -> String {
    let Some(video) = video else {
        return r#"<div class="video-box"><p class="muted">No video selected yet.</p></div>"#
            .to_string();
    };
    match media::youtube_id(&video.url) {
        Some(id) => format!(
            r#"<div class="video-box"><iframe width="100%" height="360" src="{}" title="YouTube video player" frameborder="0" allow="accelerometer; autoplay; clipboard-write; encrypted-media; gyroscope; picture-in-picture; web-share" allowfullscreen></iframe></div>"#,
            escape_html(&media::embed_url(&id))
        ),
        None => format!(
            r#"<div class="video-box"><p class="muted">Current video: <a href="{url}" target="_blank" rel="noopener">{url}</a></p></div>"#,
            url = escape_html(&video.url)
        ),
    }
}

const PAGE_STYLE: &str = r#"
      :root {
        color-scheme: dark light;
        --bg: #11151d;
        --panel: #1c2230;
        --accent: #52b4ff;
        --text: #e8edf5;
        --muted: #9aa3b7;
        font-family: "Inter", "Segoe UI", -apple-system, BlinkMacSystemFont, "Helvetica Neue", sans-serif;
      }
      body {
        margin: 0 auto;
        max-width: 720px;
        padding: 1.5rem 1rem 4rem;
        background: var(--bg);
        color: var(--text);
      }
      a { color: var(--accent); }
      .muted { color: var(--muted); }
      .card {
        background: var(--panel);
        padding: 1.25rem 1.5rem;
        border-radius: 16px;
        box-shadow: 0 18px 45px rgba(9, 17, 28, 0.45);
        margin-bottom: 1rem;
      }
      .topbar {
        display: flex;
        align-items: center;
        justify-content: space-between;
        margin-bottom: 1.5rem;
      }
      .topbar h1 { margin: 0; font-size: 1.6rem; color: var(--accent); }
      .badge {
        background: var(--accent);
        color: var(--bg);
        border-radius: 999px;
        padding: 0.15rem 0.75rem;
        font-size: 0.8rem;
        font-weight: 600;
      }
      .status { color: var(--muted); margin-bottom: 1rem; }
      .post-header, .comment-head {
        display: flex;
        gap: 0.5rem;
        color: var(--muted);
        font-size: 0.85rem;
        margin-bottom: 0.5rem;
      }
      .post-text, .comment-text { margin: 0 0 0.75rem; line-height: 1.5; }
      .media, .comment-media, .ratio iframe { max-width: 100%; border-radius: 8px; }
      .ratio { position: relative; aspect-ratio: 16 / 9; }
      .ratio iframe { width: 100%; height: 100%; border: 0; }
      .post-footer { margin-top: 0.75rem; }
      input[type="text"], input[type="password"], input[type="email"], input[type="url"], textarea {
        width: 100%;
        box-sizing: border-box;
        background: var(--bg);
        color: var(--text);
        border: 1px solid #2a3245;
        border-radius: 8px;
        padding: 0.5rem 0.75rem;
        margin-bottom: 0.5rem;
      }
      .btn {
        display: inline-block;
        padding: 0.5rem 1.25rem;
        border-radius: 999px;
        border: 0;
        background: var(--accent);
        color: var(--bg);
        font-weight: 600;
        text-decoration: none;
        cursor: pointer;
      }
      .btn-ghost {
        background: transparent;
        border: 1px solid var(--accent);
        color: var(--accent);
      }
"#;

pub struct PageContext<'a> {
    pub who: Option<String>,
    pub is_admin: bool,
    pub status: Option<&'a str>,
    pub spotlight_html: String,
    pub posts_html: String,
    pub comments_html: Option<String>,
    pub selected_post: Option<&'a str>,
    pub reached_end: bool,
}

pub fn feed_page(ctx: &PageContext) -> String {
    let who = match &ctx.who {
        Some(label) => format!(
            r#"<span class="muted">{}</span>{}
        <form method="post" action="/logout" style="display:inline"><button class="btn btn-ghost" type="submit">Sign out</button></form>"#,
            escape_html(label),
            if ctx.is_admin {
                r#" <span class="badge">admin</span>"#
            } else {
                ""
            },
        ),
        None => String::new(),
    };

    let status = match ctx.status {
        Some(message) if !message.is_empty() => {
            format!(r#"<p class="status">{}</p>"#, escape_html(message))
        }
        _ => String::new(),
    };

    let session_card = if ctx.who.is_none() {
        r#"<section class="card">
      <h2>Sign in</h2>
      <form method="post" action="/login">
        <input type="email" name="email" placeholder="email" />
        <input type="password" name="password" placeholder="password" />
        <button class="btn" type="submit" name="action" value="login">Sign in</button>
        <button class="btn btn-ghost" type="submit" name="action" value="register">Create account</button>
        <button class="btn btn-ghost" type="submit" name="action" value="provider">Sign in with provider</button>
      </form>
    </section>"#
            .to_string()
    } else {
        String::new()
    };

    let composer = if ctx.is_admin {
        r#"<section class="card" id="composer">
      <h2>Publish</h2>
      <form method="post" action="/publish">
        <textarea name="text" rows="3" placeholder="Write something"></textarea>
        <input type="url" name="url" placeholder="YouTube link, video URL (optional)" />
        <button class="btn" type="submit">Publish</button>
      </form>
    </section>"#
            .to_string()
    } else {
        String::new()
    };

    let spotlight_form = if ctx.is_admin {
        r#"<form method="post" action="/spotlight">
        <input type="url" name="url" placeholder="New current video URL" />
        <button class="btn btn-ghost" type="submit">Change video</button>
      </form>"#
    } else {
        ""
    };

    let comments = match (&ctx.comments_html, ctx.selected_post) {
        (Some(html), Some(post_id)) => {
            let comment_form = if ctx.is_admin {
                format!(
                    r#"<form method="post" action="/comment">
        <input type="hidden" name="post" value="{}" />
        <textarea name="text" rows="2" placeholder="Write a comment"></textarea>
        <button class="btn" type="submit">Send</button>
      </form>"#,
                    escape_html(post_id)
                )
            } else {
                String::new()
            };
            format!(
                r#"<section class="card" id="commentsPanel">
      <h2>Comments</h2>
      <div id="commentsList">{html}</div>
      {comment_form}
    </section>"#
            )
        }
        _ => String::new(),
    };

    let older = if ctx.reached_end {
        r#"<p class="muted">No more posts.</p>"#.to_string()
    } else {
        r#"<p><a class="btn btn-ghost" href="/older">Load older posts</a></p>"#.to_string()
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Mural</title>
    <style>{style}</style>
  </head>
  <body>
    <header class="topbar">
      <h1>Mural</h1>
      <div>{who}</div>
    </header>
    {status}
    {session_card}
    <section class="card" id="spotlight">
      <h2>Current video</h2>
      {spotlight}
      {spotlight_form}
    </section>
    {composer}
    <main id="postsList">
      {posts}
    </main>
    {older}
    {comments}
  </body>
</html>"#,
        style = PAGE_STYLE,
        who = who,
        status = status,
        session_card = session_card,
        spotlight = ctx.spotlight_html,
        spotlight_form = spotlight_form,
        composer = composer,
        posts = ctx.posts_html,
        older = older,
        comments = comments,
    )
}

#![allow(clippy::uninlined_format_args)]

pub mod admin;
pub mod app;
pub mod backend;
pub mod comments;
pub mod composer;
pub mod config;
pub mod feed;
pub mod media;
pub mod memory;
pub mod render;
pub mod rest;
pub mod session;
pub mod spotlight;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;

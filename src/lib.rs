//! Qanun: a streaming legal-assistant chat core.
//!
//! Sessions live in a [`session::SessionStore`]; [`chat::ChatController`]
//! streams replies from an [`ai::LLMBackend`] into them, and [`render`] turns
//! message text plus citations into structured blocks or HTML.

pub mod ai;
pub mod chat;
pub mod config;
pub mod render;
pub mod session;
pub mod storage;
pub mod stream;
pub mod types;

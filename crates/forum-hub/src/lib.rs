//! Forum real-time hub library.
//!
//! Presence tracking, private messaging and live forum updates over
//! WebSockets.

pub mod api;
pub mod auth;
pub mod db;
pub mod messages;
pub mod presence;
pub mod ws;

//! HTTP handlers, grouped per surface.

pub mod chat;
pub mod health;
pub mod sessions;

//! HTTP surface. Each sub-module owns one `/api/...` scope and exposes a
//! `configure_routes()` returning it.

pub mod artifacts;
pub mod credits;
pub mod health;
pub mod jobs;
pub mod processors;

//! `wharf` — a minimal PaaS deployment engine.
//!
//! Clones a user's repository, builds a container image from its
//! `Dockerfile`, runs it under resource caps, and publishes it behind a
//! per-app subdomain. See `DESIGN.md` for how each module maps onto the
//! components this is grounded on.

pub mod api;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod model;
pub mod quota;
pub mod router;
pub mod source;
pub mod store;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! genserve: a demo server that streams model-generated HTML to a browser,
//! one token at a time.
//!
//! The interesting part is the admission-and-lifecycle controller in
//! [`registry`] and [`lifecycle`]: it caps concurrent generations, cancels
//! them on timeout or client disconnect, and exposes introspection state.
//! The model itself sits behind the [`engine::GenerationEngine`] trait.

pub mod config;
pub mod engine;
pub mod http_server;
pub mod lifecycle;
pub mod logging;
pub mod registry;

//! Push stream HTTP handler for the web layer.
//!
//! This module contains only the Axum handler for the push endpoint.
//! The connection core (Manager, ConnectionRegistry, delivery) lives in the
//! `sse` crate.

pub(crate) mod handler;

//! Server-Sent Events (SSE) connection management, single node or clustered.
//!
//! # Architecture
//!
//! - **Connection registry**: every open SSE stream is a [`connection::Connection`]
//!   held in a [`registry::ConnectionRegistry`], indexed by access token, user
//!   id, tenant id and channel for O(1) addressing.
//! - **Connection lifecycle**: `CREATED -> WRITEABLE -> DISCONNECTED`. Events sent
//!   before the HTTP stream is writeable are buffered and flushed in order.
//! - **Send services**: the [`send::SendService`] trait exposes the five
//!   addressing targets (all, channel, access token, user id, tenant id), each
//!   with a `_listening` variant. The [`Manager`] sends on this node,
//!   [`cluster::ClusterConnectionService`] on every node, and
//!   [`qos::AtLeastOnceDelivery`] stores what reached nobody and resends it
//!   when a matching connection appears.
//! - **Cluster**: peers are reached over a small JSON RPC protocol; results are
//!   merged with per operation combiners and unreachable peers are skipped.
//!
//! # Message Flow
//!
//! 1. Client opens `GET /sse/connect`; the web layer authenticates it and calls
//!    [`Manager::connect`], which queues `connect-finish`.
//! 2. The first poll of the response stream calls
//!    [`connection::Connection::writeable_ready`], flushing buffered events.
//! 3. Application code sends through any [`send::SendService`].
//! 4. When the stream ends the connection disconnects exactly once and leaves
//!    every index.
//!
//! # Modules
//!
//! - `access_user`: the authenticated user and typed reconstruction of users received from peers
//! - `connection`: connection state machine, ids and listening sets
//! - `registry`: indices and lifecycle listeners
//! - `manager`: the local connection service
//! - `message`: addressing filters and stored messages
//! - `cluster`: discovery, peer clients and map-reduce aggregation
//! - `qos`: at-least-once delivery

pub mod access_user;
pub mod cluster;
pub mod connection;
pub mod error;
pub mod event;
pub mod manager;
pub mod message;
pub mod qos;
pub mod reference_counted;
pub mod registry;
pub mod send;

pub use manager::Manager;

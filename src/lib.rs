//! # rag-sync
//!
//! Event-driven ingestion pipeline that keeps a vector index in step with a
//! Nextcloud file store.
//!
//! Change notifications arrive at an HTTP gateway, are authenticated and
//! routed onto per-role durable queues, and are applied by two independent
//! consumers: one re-indexes file content, the other stamps read
//! permissions on the indexed chunks and periodically reconciles them.
//!
//! ## Architecture
//!
//! ```text
//!                ┌───────────┐     content queue    ┌──────────────────┐
//! notification ─▶│  Gateway  │─────────────────────▶│ Content consumer │──▶ File store, pipeline,
//!  (HMAC/token)  │ auth+route│                      └────────┬─────────┘    index, metadata
//!                └─────┬─────┘                               │ acl.changed follow-up
//!                      │          access queue      ┌────────▼─────────┐
//!                      └───────────────────────────▶│ Access consumer  │──▶ File store shares,
//!                                                   │  + reconciler    │    index payloads
//!                                                   └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag-sync init                 # create metadata and queue tables
//! rag-sync gateway              # receive notifications
//! rag-sync content-worker       # index file content
//! rag-sync access-worker        # propagate permissions
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`error`] | Failure taxonomy shared by every component |
//! | [`models`] | Core data types |
//! | [`event`] | Notification shapes and normalisation into jobs |
//! | [`path`] | Notification path resolution |
//! | [`auth`] | Signature and token verification |
//! | [`gateway`] | HTTP surface |
//! | [`queue`] | Durable per-role work queues |
//! | [`worker`] | Consumer loop, content and access consumers |
//! | [`metadata`] | Record of indexed files |
//! | [`index`] | Vector index client |
//! | [`filestore`] | WebDAV file store client |
//! | [`access`] | Permission derivation rules |
//! | [`pipeline`] | Extract, chunk, embed and upsert |
//! | [`extract`] | Text extraction from PDF and OOXML |
//! | [`chunk`] | Paragraph-aware text chunking |
//! | [`embedding`] | Embedding provider |
//! | [`db`] | SQLite connection pools |
//! | [`migrate`] | Schema migrations |

pub mod access;
pub mod auth;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod event;
pub mod extract;
pub mod filestore;
pub mod gateway;
pub mod index;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod path;
pub mod pipeline;
pub mod queue;
pub mod worker;

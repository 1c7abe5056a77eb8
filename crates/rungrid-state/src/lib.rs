//! rungrid-state: embedded object store for rungrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds scale targets, autoscalers,
//! owners, agents and credentials.
//!
//! # Architecture
//!
//! Objects are JSON-serialized into redb's `&[u8]` value columns under
//! `{namespace}/{name}` keys, one table per kind. Every object carries an
//! [`ObjectMeta`] with labels, annotations, finalizers and a resource
//! version used for optimistic concurrency.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod meta;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use meta::*;
pub use store::StateStore;
pub use types::*;

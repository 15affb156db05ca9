//! Indexing Cache — a write-back cache and prefetch layer sitting between
//! chain-event handlers and a SQL store, plus a sibling cache for the RPC
//! calls those handlers make.
//!
//! `cache` is the core: a per-table write-back overlay with LRU eviction
//! and a bulk COPY-based flush protocol. `store` is the façade handlers
//! actually call (`find`/`insert`/`update`/`delete`/`sql`). `rpc` is the
//! independent, concurrent cache fronting the upstream chain node.
//! `pattern` is the machinery both `store` and `rpc` share to recover
//! prefetchable requests from a handler's past behavior; `prefetch` drives
//! it for a batch of events. `codec`, `normalizer`, `executor`, `event`,
//! `config` and `error` are the supporting types everything else is built
//! from.

pub mod cache;
pub mod codec;
pub mod common;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod normalizer;
pub mod pattern;
pub mod prefetch;
pub mod rpc;
pub mod store;

pub use cache::IndexingCache;
pub use common::{ChainId, Line, Point, PartialRow, Row, RowMap, TableName, Value};
pub use config::Config;
pub use error::{CacheError, Result};
pub use event::{Event, EventVariant};
pub use executor::{Executor, Transaction};
pub use store::HistoricalIndexingStore;

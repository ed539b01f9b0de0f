//! Local-first storage core for the Viking Scouts event manager.
//!
//! The crate owns two backing stores: a versioned SQLite-backed object
//! store (one logical store per record family, JSON rows plus typed index
//! columns) and the legacy flat key-value store the data is migrating away
//! from. A key router decides which backing owns each key and falls back
//! to the legacy store when the object store cannot serve. On top of that
//! sit the domain stores (members, events, attendance, terms), the phased
//! migration engine, and the optimistic camp-group move engine.

pub mod active_term;
pub mod attendance_store;
pub mod camp_groups;
pub mod config;
pub mod db;
mod error;
pub mod event_store;
pub mod handle;
pub mod key_router;
pub mod legacy_kv;
pub mod logging;
pub mod member_store;
pub mod migrate;
pub mod migration_engine;
pub mod model;
pub mod network_status;
pub mod object_store;
pub mod stores;
pub mod time;
pub mod validation;

pub use crate::config::StoreConfig;
pub use crate::error::{AppError, AppResult};
pub use crate::handle::DbHandle;
pub use crate::key_router::{Backing, CacheEntryType, KeyRouter, Target};
pub use crate::legacy_kv::{KvError, LegacyKv};
pub use crate::migrate::DATABASE_VERSION;
pub use crate::object_store::{IndexQuery, ObjectStore};
pub use crate::stores::{Key, StoreName};

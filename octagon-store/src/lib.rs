//! SQLite persistence for Octagon.
//!
//! One database file holds every (container, context) pair on the device:
//!
//! - `account_metadata`: the durable [`AccountMetadata`] record, stored as a
//!   JSON blob and always replaced whole
//! - `secret_items`: opaque secret blobs (local identity, bottle entropy)
//!   addressed by (container, context, kind)
//!
//! [`AccountMetadata`]: octagon_types::AccountMetadata

mod account_store;
mod error;

pub use account_store::AccountStore;
pub use error::{StorageError, StorageResult};

//! # Courier
//!
//! A personal message relay: receives broadcast-style notices addressed
//! to `(class, instance, user)` triplets, persists them, and lets clients
//! retrieve, filter, mark, and delete stored messages through composable,
//! cacheable query objects.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: wildcard `(class, instance, user)` triplets with a
//!   fast matching index and a persisted subscription file
//! - **Filters**: immutable DNF predicates over stored messages, registered
//!   under a stable structural hash (`fid`)
//! - **Messenger**: the SQLite-backed store, the filter registry, and the
//!   receiver loop consuming an abstract notice source
//!
//! The wire transport, RPC dispatch, and the notice protocol client are
//! external collaborators: the transport calls the operations exposed
//! here, and the protocol client feeds a [`NoticeSource`] / drains a
//! [`NoticeSink`].
//!
//! ## Example
//!
//! ```ignore
//! use courier::{Messenger, MessengerConfig, SubscriptionManager};
//! use std::sync::Arc;
//!
//! let subs = Arc::new(SubscriptionManager::open("me", "~/.courier/subs")?);
//! let messenger = Arc::new(Messenger::new(
//!     MessengerConfig::new("me"),
//!     subs,
//!     source, // inbound notices from the protocol client
//!     sink,   // outbound notices to the protocol client
//!     prefs,
//! )?);
//!
//! messenger.start()?;
//! let fid = messenger.filter_messages(&[clause])?;
//! let page = messenger.get(fid, 0, 20)?;
//! ```

pub mod error;
pub mod filter;
pub mod messenger;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{RelayError, Result};
pub use filter::{ClauseSpec, Filter, FilterId};
pub use messenger::{FilterPage, Messenger, MessengerConfig, DEFAULT_FILTER_CAPACITY};
pub use store::MessageStore;
pub use subscriptions::{SubscriptionManager, Triplet, WILDCARD};
pub use transport::{
    ChannelSource, MemorySink, NoticeInjector, NoticeSink, NoticeSource, Preferences,
    StaticPreferences,
};
pub use types::*;

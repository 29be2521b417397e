//! Subscription triplets and wildcard matching.

pub mod manager;
pub mod types;

pub use manager::SubscriptionManager;
pub use types::{parse_line, SubLine, Triplet, WILDCARD};

//! Chain access: the firewalled RPC client and confirmation tracking
//!
//! This module provides:
//! - The declarative JSON-RPC table and the allow-list derived from it
//! - `NodeClient`, the narrow node interface the engine depends on
//! - Receipt polling with depth and reorg checks
//! - The block and contract event follower

pub mod client;
pub mod events;
pub mod firewall;
pub mod watcher;

pub use client::{NodeClient, RpcClient};
pub use events::{BlockFollower, BlockRef, ChainEvent, EventFeed, FeedEntry};
pub use watcher::{ConfirmationPolicy, ConfirmationWatcher, ReceiptPoller, WatchOutcome};

//! # SFU Test Utilities
//!
//! Mocks and fixtures for testing the SFU controller without a media
//! engine, Redis or real sockets.
//!
//! ## Modules
//!
//! - `mock_engine` - In-memory media engine with failure injection
//! - `mock_channel` - Recording signaling channel with scripted acks
//! - `mock_stores` - Identity and membership stores backed by maps
//! - `fixtures` - Client events, grants and pool settings
//! - `harness` - Registry, pool and gateway wired over the mocks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = RoomHarness::start(2).await;
//!
//!     let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
//!     let bob = harness.join("room-1", "bob", fixtures::listener()).await;
//!     alice.config_and_sync().await;
//!     bob.config_and_sync().await;
//!
//!     let producer_id = alice.produce(MediaKind::Audio).await.unwrap();
//!     assert!(wait_until(|| bob.channel.make_consumer_for(&producer_id).is_some()).await);
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_channel;
pub mod mock_engine;
pub mod mock_stores;

pub use harness::{eventually, wait_until, RoomHarness, TestClient, WAIT};
pub use mock_channel::{AckPolicy, MockChannel};
pub use mock_engine::{MockEngine, MockRouter, MockWorker};
pub use mock_stores::{MembershipOp, MockIdentityStore, MockMembershipStore};

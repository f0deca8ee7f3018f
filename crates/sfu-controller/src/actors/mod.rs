//! Actor model for room orchestration.
//!
//! ```text
//! RoomRegistryActor (singleton per instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── owns the router and every session
//!         └── ParticipantSession (one per connected participant)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Per-room serialization**: a room handles one message at a time; rooms
//!   never share state, so there is no global lock
//! - **CancellationToken propagation**: rooms run on child tokens of the registry
//! - **Mailbox monitoring**: backlog read from the sender on each receive, thresholds below channel capacity (Registry: 100/500, Room: 100/400)
//! - **Acknowledgements as messages**: client acks are awaited in spawned
//!   tasks and posted back to the room mailbox, so the loop never blocks on a client
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor`, get-or-create and close of rooms
//! - [`room`] - `RoomActor` per live room
//! - [`session`] - Per-participant session state
//! - [`fanout`] - Producer-to-consumer matching
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod fanout;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod session;

// Re-export primary types
pub use messages::{
    AddOutcome, DisconnectReason, JoinOptions, ParticipantSnapshot, RegistryStatus, RoomState,
    SessionState,
};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::RoomHandle;
pub use session::ParticipantSession;

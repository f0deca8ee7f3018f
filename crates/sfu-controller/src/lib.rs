//! SFU Controller Library
//!
//! Session orchestration for a WebRTC selective forwarding unit. The media
//! plane lives in an external engine; this crate decides who may send what,
//! routes every published track to every other eligible participant, and
//! keeps room and participant state consistent while clients come and go.
//!
//! # Architecture
//!
//! ```text
//! WebSocket server ──► SignalingGateway ──► RoomRegistryActor
//!                                              └── RoomActor (one per room)
//!                                                   ├── MediaRouter (engine)
//!                                                   └── ParticipantSession ×N
//! WorkerPool ── least-loaded placement of new rooms, CPU sampler, death watch
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry and room actors, sessions, fan-out matching
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine boundary (mediasoup adapter behind a feature)
//! - [`errors`] - Error types and their handling classes
//! - [`isolation`] - Per-event failure containment
//! - [`observability`] - Metrics and health endpoints
//! - [`permissions`] - Authorization gate
//! - [`signaling`] - Wire protocol, channel abstraction, WebSocket server
//! - [`stores`] - Identity, permission and membership stores
//! - [`workers`] - Media worker pool

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod isolation;
pub mod observability;
pub mod permissions;
pub mod signaling;
pub mod stores;
pub mod workers;

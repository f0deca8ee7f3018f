//! Observability for the SFU controller.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Session tokens and the Redis URL are never logged.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Live rooms on this instance |
//! | `sfu_participants_active` | Gauge | none | Joined sessions across rooms |
//! | `sfu_worker_load` | Gauge | `worker` | Sampled CPU load per media worker |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure per actor type |
//! | `sfu_consumers_created_total` | Counter | none | Consumers created by fan-out |
//! | `sfu_handler_failures_total` | Counter | `event`, `class` | Isolated handler failures |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor task panics |
//! | `sfu_signaling_frames_dropped_total` | Counter | none | Frames dropped on full queues |
//! | `sfu_connections_rejected_total` | Counter | `reason` | Refused WebSocket upgrades |
//! | `sfu_room_creation_duration_seconds` | Histogram | none | Router plus observer setup time |
//! | `sfu_message_latency_seconds` | Histogram | `event` | Client event handling time |
//! | `sfu_redis_latency_seconds` | Histogram | `operation` | Store round trips |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;

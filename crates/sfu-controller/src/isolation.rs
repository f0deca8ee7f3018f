//! Handler failure containment.
//!
//! Every client event and engine notification runs through [`isolate`].
//! A failure is logged with room, participant and event, counted, and
//! swallowed: the caller gets `None` and the room keeps serving everyone
//! else. Panics are caught as well and reported as their own class.
//!
//! | Class | Log level |
//! |-------|-----------|
//! | `rejected_by_policy` | debug |
//! | `transient` | warn |
//! | `invariant_violation` | error |
//! | `fatal` | error |
//! | panic | error |

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::actors::metrics::ActorMetrics;
use crate::errors::{ErrorClass, SfuError};
use crate::observability::metrics as prom;

/// Where a handler ran, for failure reports.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub room_id: String,
    pub participant_id: Option<String>,
    pub event: &'static str,
    metrics: Arc<ActorMetrics>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(room_id: impl Into<String>, event: &'static str, metrics: Arc<ActorMetrics>) -> Self {
        Self {
            room_id: room_id.into(),
            participant_id: None,
            event,
            metrics,
        }
    }

    #[must_use]
    pub fn participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }

    fn participant_field(&self) -> &str {
        self.participant_id.as_deref().unwrap_or("-")
    }

    fn report_error(&self, err: &SfuError) {
        let class = err.class();
        match class {
            ErrorClass::RejectedByPolicy => debug!(
                target: "sfu.isolation",
                room_id = %self.room_id,
                participant_id = %self.participant_field(),
                event = self.event,
                class = class.as_str(),
                error = %err,
                "Handler rejected by policy"
            ),
            ErrorClass::Transient => warn!(
                target: "sfu.isolation",
                room_id = %self.room_id,
                participant_id = %self.participant_field(),
                event = self.event,
                class = class.as_str(),
                error = %err,
                "Handler failed"
            ),
            ErrorClass::InvariantViolation | ErrorClass::Fatal => error!(
                target: "sfu.isolation",
                room_id = %self.room_id,
                participant_id = %self.participant_field(),
                event = self.event,
                class = class.as_str(),
                error = %err,
                "Handler failed"
            ),
        }
        self.metrics.record_handler_failure();
        prom::record_handler_failure(self.event, class.as_str());
    }

    fn report_panic(&self, payload: &(dyn Any + Send)) {
        error!(
            target: "sfu.isolation",
            room_id = %self.room_id,
            participant_id = %self.participant_field(),
            event = self.event,
            class = "panic",
            panic = %panic_message(payload),
            "Handler panicked"
        );
        self.metrics.record_handler_failure();
        prom::record_handler_failure(self.event, "panic");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run a handler, containing any error or panic it produces.
///
/// State the handler committed before failing stays committed.
pub async fn isolate<T, F>(ctx: HandlerContext, handler: F) -> Option<T>
where
    F: Future<Output = Result<T, SfuError>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            ctx.report_error(&err);
            None
        }
        Err(payload) => {
            ctx.report_panic(payload.as_ref());
            None
        }
    }
}

//! Pre-configured test data.
//!
//! Client events, grants and pool settings used across the integration
//! tests.

use serde_json::{json, Value};
use sfu_controller::actors::JoinOptions;
use sfu_controller::engine::{AppData, MediaKind};
use sfu_controller::permissions::{Grants, Permission};
use sfu_controller::signaling::protocol::{
    ClientConfig, ConnectTransport, ProduceParams, ProducerRef,
};
use sfu_controller::signaling::ClientEvent;
use sfu_controller::workers::PoolSettings;
use std::time::Duration;

pub use crate::mock_engine::{capabilities_for, full_capabilities};

/// Pool settings for `size` mock workers.
#[must_use]
pub fn pool_settings(size: usize) -> PoolSettings {
    PoolSettings {
        size,
        webrtc_port_base: 44_444,
        announced_address: None,
        rtc_min_port: 40_000,
        rtc_max_port: 49_999,
        death_grace: Duration::from_millis(50),
    }
}

// ----------------------------------------------------------------------------
// Grants
// ----------------------------------------------------------------------------

/// May produce audio and video.
#[must_use]
pub fn speaker() -> Grants {
    Grants::with_permissions([Permission::Speak, Permission::ShareVideo])
}

/// Audio only.
#[must_use]
pub fn audio_only() -> Grants {
    Grants::with_permissions([Permission::Speak])
}

/// No permissions: consumes only.
#[must_use]
pub fn listener() -> Grants {
    Grants::default()
}

#[must_use]
pub fn admin() -> Grants {
    Grants::admin()
}

/// Both deployment switches on.
#[must_use]
pub fn join_options(grants: Grants) -> JoinOptions {
    JoinOptions {
        allow_produce: true,
        allow_consume: true,
        grants,
    }
}

// ----------------------------------------------------------------------------
// Client events
// ----------------------------------------------------------------------------

#[must_use]
pub fn config_event(receive_capabilities: Option<Value>) -> ClientEvent {
    ClientEvent::Config(ClientConfig {
        device: json!({ "flag": "test" }),
        receive_capabilities,
        data_capabilities: None,
    })
}

#[must_use]
pub fn connect_event(transport_id: &str) -> ClientEvent {
    ClientEvent::ConnectTransport(ConnectTransport {
        transport_id: transport_id.to_string(),
        dtls_parameters: json!({ "role": "client", "fingerprints": [] }),
    })
}

#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> Value {
    json!({
        "mid": "0",
        "codecs": [ { "kind": kind.as_str(), "payloadType": 100 } ],
        "encodings": [ { "ssrc": 1111 } ],
    })
}

#[must_use]
pub fn produce_event(transport_id: &str, kind: MediaKind) -> ClientEvent {
    let mut app_data = AppData::new();
    app_data.insert("source".to_string(), json!(kind.as_str()));
    ClientEvent::Produce(ProduceParams {
        transport_id: transport_id.to_string(),
        kind,
        rtp_parameters: rtp_parameters(kind),
        app_data,
    })
}

#[must_use]
pub fn producer_ref(producer_id: &str) -> ProducerRef {
    ProducerRef {
        producer_id: producer_id.to_string(),
    }
}

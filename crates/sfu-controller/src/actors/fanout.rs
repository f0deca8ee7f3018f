//! Producer-to-consumer matching within a room.
//!
//! Invariant: for every producer and every other synced participant able to
//! decode it, that participant holds exactly one consumer of it, created
//! paused and resumed only after the client acknowledges `make-consumer`.
//!
//! Both triggers (a participant finishing its join, a new producer) go
//! through [`create_consumer`], which is a no-op for a pair that already
//! has a consumer. The ordering of the two triggers therefore cannot
//! produce duplicates.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::session::{ConsumerRecord, ParticipantSession};
use crate::engine::{AppData, ConsumeRequest, MediaKind, MediaRouter, TransportDirection};
use crate::errors::SfuError;
use crate::observability::metrics as prom;
use crate::signaling::protocol::{ConsumerRef, MakeConsumer};
use crate::signaling::ServerEvent;

/// The producer side of a consumer to create.
#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub producer_id: String,
    pub owner_id: String,
    pub kind: MediaKind,
    pub app_data: AppData,
}

/// A `make-consumer` request awaiting its client acknowledgement.
#[derive(Debug)]
pub struct PendingConsumerAck {
    pub participant_id: String,
    pub session_id: Uuid,
    pub consumer_id: String,
    pub ack: oneshot::Receiver<Value>,
}

/// Every producer the joining participant should consume, in stable order.
///
/// Producers only exist on joined sessions, so no state filter is needed
/// on the owners.
#[must_use]
pub fn producers_for_joiner(
    participants: &HashMap<String, ParticipantSession>,
    joiner_id: &str,
) -> Vec<ProducerInfo> {
    let mut owners: Vec<&ParticipantSession> = participants
        .values()
        .filter(|p| p.participant_id() != joiner_id && p.is_joined())
        .collect();
    owners.sort_by(|a, b| a.participant_id().cmp(b.participant_id()));

    let mut infos = Vec::new();
    for owner in owners {
        let mut producers: Vec<(&String, _)> = owner.producers().collect();
        producers.sort_by(|a, b| a.0.cmp(b.0));
        for (producer_id, record) in producers {
            infos.push(ProducerInfo {
                producer_id: producer_id.clone(),
                owner_id: owner.participant_id().to_string(),
                kind: record.kind,
                app_data: record.app_data.clone(),
            });
        }
    }
    infos
}

/// Participants that should receive a new producer from `owner_id`.
#[must_use]
pub fn consumers_for_producer(
    participants: &HashMap<String, ParticipantSession>,
    owner_id: &str,
) -> Vec<String> {
    let mut ids: Vec<String> = participants
        .values()
        .filter(|p| p.participant_id() != owner_id && p.is_synced())
        .map(|p| p.participant_id().to_string())
        .collect();
    ids.sort();
    ids
}

/// Create one paused consumer of `producer` for `consuming`.
///
/// Returns `Ok(None)` without touching the engine when the pair already has
/// a consumer, the participant has no consumer transport or capabilities,
/// or the engine reports the capabilities cannot decode the producer.
pub async fn create_consumer(
    router: &dyn MediaRouter,
    consuming: &mut ParticipantSession,
    producer: &ProducerInfo,
) -> Result<Option<PendingConsumerAck>, SfuError> {
    if consuming.has_consumer_for(&producer.producer_id) {
        return Ok(None);
    }

    let Some(transport_id) = consuming
        .transport_for(TransportDirection::Consumer)
        .map(str::to_string)
    else {
        return Ok(None);
    };

    let Some(capabilities) = consuming.receive_capabilities().cloned() else {
        debug!(
            target: "sfu.room",
            participant_id = %consuming.participant_id(),
            "No receive capabilities, skipping consumer"
        );
        return Ok(None);
    };

    if !router.can_consume(&producer.producer_id, &capabilities) {
        debug!(
            target: "sfu.room",
            participant_id = %consuming.participant_id(),
            producer_id = %producer.producer_id,
            "Capabilities cannot consume producer"
        );
        return Ok(None);
    }

    let descriptor = router
        .consume(ConsumeRequest {
            transport_id,
            producer_id: producer.producer_id.clone(),
            rtp_capabilities: capabilities,
            paused: true,
        })
        .await?;

    consuming.add_consumer(
        descriptor.id.clone(),
        ConsumerRecord {
            producer_id: producer.producer_id.clone(),
            producer_participant_id: producer.owner_id.clone(),
            kind: descriptor.kind,
            client_paused: false,
            producer_paused: descriptor.producer_paused,
            acknowledged: false,
        },
    );
    prom::record_consumer_created();

    debug!(
        target: "sfu.room",
        participant_id = %consuming.participant_id(),
        producer_id = %producer.producer_id,
        consumer_id = %descriptor.id,
        "Consumer created paused"
    );

    let ack = consuming
        .channel()
        .request(ServerEvent::MakeConsumer(MakeConsumer {
            peer_id: producer.owner_id.clone(),
            producer_id: producer.producer_id.clone(),
            consumer_id: descriptor.id.clone(),
            kind: descriptor.kind,
            rtp_parameters: descriptor.rtp_parameters,
            consumer_type: descriptor.consumer_type,
            app_data: producer.app_data.clone(),
            producer_paused: descriptor.producer_paused,
        }));

    Ok(Some(PendingConsumerAck {
        participant_id: consuming.participant_id().to_string(),
        session_id: consuming.session_id(),
        consumer_id: descriptor.id,
        ack,
    }))
}

/// Remove every consumer of a closed producer and tell each owner once.
///
/// Returns `(participant_id, consumer_id)` for each removed consumer.
pub fn sweep_producer(
    participants: &mut HashMap<String, ParticipantSession>,
    producer_id: &str,
) -> Vec<(String, String)> {
    let mut removed = Vec::new();
    for session in participants.values_mut() {
        if let Some(consumer_id) = session.remove_consumer_of(producer_id) {
            session.emit(ServerEvent::ConsumerClosed(ConsumerRef {
                consumer_id: consumer_id.clone(),
            }));
            removed.push((session.participant_id().to_string(), consumer_id));
        }
    }
    removed.sort();
    removed
}

/// Participant owning `consumer_id`.
#[must_use]
pub fn consumer_owner(
    participants: &HashMap<String, ParticipantSession>,
    consumer_id: &str,
) -> Option<String> {
    participants
        .values()
        .find(|p| p.owns_consumer(consumer_id))
        .map(|p| p.participant_id().to_string())
}

/// Participant owning `producer_id`.
#[must_use]
pub fn producer_owner(
    participants: &HashMap<String, ParticipantSession>,
    producer_id: &str,
) -> Option<String> {
    participants
        .values()
        .find(|p| p.owns_producer(producer_id))
        .map(|p| p.participant_id().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::permissions::Grants;
    use crate::signaling::protocol::ClientConfig;
    use crate::signaling::SignalingChannel;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingChannel {
        emitted: Mutex<Vec<ServerEvent>>,
    }

    impl SignalingChannel for RecordingChannel {
        fn id(&self) -> &str {
            "rec"
        }
        fn emit(&self, event: ServerEvent) {
            self.emitted.lock().unwrap().push(event);
        }
        fn request(&self, event: ServerEvent) -> oneshot::Receiver<Value> {
            self.emit(event);
            oneshot::channel().1
        }
        fn disconnect(&self) {}
    }

    fn joined(id: &str, channel: Arc<RecordingChannel>, synced: bool) -> ParticipantSession {
        let mut s = ParticipantSession::new(
            id.to_string(),
            channel,
            Grants::admin(),
            vec![(format!("{id}-recv"), TransportDirection::Consumer)],
        );
        s.confirm_join(ClientConfig {
            device: Value::Null,
            receive_capabilities: Some(json!({"codecs": ["audio", "video"]})),
            data_capabilities: None,
        })
        .unwrap();
        if synced {
            s.mark_synced().unwrap();
        }
        s
    }

    fn consumer(producer_id: &str, owner: &str) -> ConsumerRecord {
        ConsumerRecord {
            producer_id: producer_id.to_string(),
            producer_participant_id: owner.to_string(),
            kind: MediaKind::Audio,
            client_paused: false,
            producer_paused: false,
            acknowledged: true,
        }
    }

    #[test]
    fn test_new_producer_targets_synced_others_only() {
        let mut participants = HashMap::new();
        for (id, synced) in [("a", true), ("b", true), ("c", false)] {
            participants.insert(
                id.to_string(),
                joined(id, Arc::new(RecordingChannel::default()), synced),
            );
        }
        assert_eq!(consumers_for_producer(&participants, "a"), vec!["b"]);
    }

    #[test]
    fn test_sweep_notifies_each_owner_once() {
        let b_channel = Arc::new(RecordingChannel::default());
        let c_channel = Arc::new(RecordingChannel::default());
        let mut b = joined("b", Arc::clone(&b_channel), true);
        let mut c = joined("c", Arc::clone(&c_channel), true);
        b.add_consumer("cb".to_string(), consumer("p-a", "a"));
        c.add_consumer("cc".to_string(), consumer("p-a", "a"));
        c.add_consumer("cc2".to_string(), consumer("p-other", "d"));

        let mut participants = HashMap::new();
        participants.insert("b".to_string(), b);
        participants.insert("c".to_string(), c);

        let removed = sweep_producer(&mut participants, "p-a");
        assert_eq!(
            removed,
            vec![
                ("b".to_string(), "cb".to_string()),
                ("c".to_string(), "cc".to_string())
            ]
        );
        assert_eq!(b_channel.emitted.lock().unwrap().len(), 1);
        assert_eq!(c_channel.emitted.lock().unwrap().len(), 1);

        // Second sweep finds nothing
        assert!(sweep_producer(&mut participants, "p-a").is_empty());
        assert_eq!(consumer_owner(&participants, "cc2").as_deref(), Some("c"));
        assert!(consumer_owner(&participants, "cc").is_none());
    }
}

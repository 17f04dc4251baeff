//! Server-side sync protocol handlers.
//!
//! Each handler consumes a request envelope and produces the response
//! envelope for the transport to ship back. Malformed requests answer with
//! `BadRequest`; storage failures answer with `InternalError` rather than
//! dropping the stream.

use crate::network::StreamHandler;
use dvq_messages::{Status, SsvMessage, SsvMsgType, SyncMessage, SyncProtocol};
use dvq_qbft::QbftStore;
use dvq_types::Height;
use std::sync::Arc;
use tracing::debug;

fn respond(request: &SsvMessage, sm: &SyncMessage) -> SsvMessage {
    SsvMessage {
        msg_type: SsvMsgType::Sync,
        msg_id: request.msg_id,
        fork_version: request.fork_version,
        data: sm.encode().unwrap_or_default(),
    }
}

fn bad_request(request: &SsvMessage, protocol: SyncProtocol) -> SsvMessage {
    let mut sm = SyncMessage::request(protocol, request.msg_id, vec![]);
    sm.update_error(Status::BadRequest);
    respond(request, &sm)
}

/// Serve the highest stored decided certificate for an identifier.
pub fn last_decided_handler(store: Arc<dyn QbftStore>) -> StreamHandler {
    Arc::new(move |request: SsvMessage| {
        let mut sm = match SyncMessage::decode(&request.data) {
            Ok(sm) => sm,
            Err(err) => {
                debug!(%err, "failed to decode last-decided request");
                return Ok(bad_request(&request, SyncProtocol::LastDecided));
            }
        };

        match store.get_highest_instance(&request.msg_id) {
            Ok(highest) => {
                sm.update_results(highest.map(|si| si.decided_message).into_iter().collect())
            }
            Err(err) => {
                debug!(%err, "last-decided lookup failed");
                sm.update_error(Status::InternalError);
            }
        }
        Ok(respond(&request, &sm))
    })
}

/// Serve a contiguous batch of decided certificates, clamped to
/// `max_batch_size` heights.
pub fn decided_history_handler(store: Arc<dyn QbftStore>, max_batch_size: u64) -> StreamHandler {
    Arc::new(move |request: SsvMessage| {
        let mut sm = match SyncMessage::decode(&request.data) {
            Ok(sm) => sm,
            Err(err) => {
                debug!(%err, "failed to decode history request");
                return Ok(bad_request(&request, SyncProtocol::DecidedHistory));
            }
        };

        let [from, to] = sm.params.heights[..] else {
            sm.update_error(Status::BadRequest);
            return Ok(respond(&request, &sm));
        };
        if to < from {
            sm.update_error(Status::BadRequest);
            return Ok(respond(&request, &sm));
        }

        // The server never returns more than its configured window.
        let to = if to.0 - from.0 > max_batch_size {
            Height(from.0 + max_batch_size)
        } else {
            to
        };
        sm.params.heights = vec![from, to];

        match store.get_instances_in_range(&request.msg_id, from, to) {
            Ok(instances) => {
                sm.update_results(instances.into_iter().map(|si| si.decided_message).collect())
            }
            Err(err) => {
                debug!(%err, "history lookup failed");
                sm.update_error(Status::InternalError);
            }
        }
        Ok(respond(&request, &sm))
    })
}

/// Serve the last round-change message per signer (legacy fork only).
pub fn last_change_round_handler(store: Arc<dyn QbftStore>) -> StreamHandler {
    Arc::new(move |request: SsvMessage| {
        let mut sm = match SyncMessage::decode(&request.data) {
            Ok(sm) => sm,
            Err(err) => {
                debug!(%err, "failed to decode change-round request");
                return Ok(bad_request(&request, SyncProtocol::LastChangeRound));
            }
        };

        match store.get_last_change_round(&request.msg_id) {
            Ok(msgs) => sm.update_results(msgs),
            Err(err) => {
                debug!(%err, "change-round lookup failed");
                sm.update_error(Status::InternalError);
            }
        }
        Ok(respond(&request, &sm))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvq_messages::{CommitData, Message, MessageType, SignedMessage};
    use dvq_qbft::{InMemoryStore, InstanceState, Stage, StoredInstance};
    use dvq_types::{MessageId, OperatorId, Role, Round, SignatureBytes};
    use ssz::Encode;

    fn id() -> MessageId {
        MessageId::new(&[4u8; 48], Role::Attester)
    }

    fn stored(height: u64) -> StoredInstance {
        let decided = SignedMessage {
            signature: SignatureBytes::ZERO,
            signers: vec![OperatorId(1), OperatorId(2), OperatorId(3)],
            message: Message {
                msg_type: MessageType::Commit,
                height: Height(height),
                round: Round(1),
                identifier: id(),
                data: CommitData { data: vec![1] }.as_ssz_bytes(),
            },
        };
        StoredInstance {
            state: InstanceState {
                identifier: id(),
                height: Height(height),
                round: Round(1),
                stage: Stage::Decided,
                prepared_round: Some(Round(1)),
                prepared_value: Some(vec![1]),
                proposal_accepted_for_current_round: None,
                decided: true,
                decided_value: Some(vec![1]),
            },
            decided_message: decided,
        }
    }

    fn request(protocol: SyncProtocol, heights: Vec<Height>) -> SsvMessage {
        let sm = SyncMessage::request(protocol, id(), heights);
        SsvMessage {
            msg_type: SsvMsgType::Sync,
            msg_id: id(),
            fork_version: 0,
            data: sm.encode().unwrap(),
        }
    }

    #[test]
    fn history_clamps_to_batch_window() {
        let store = Arc::new(InMemoryStore::new());
        for h in 0..=40u64 {
            store.save_instance(&stored(h)).unwrap();
        }
        let handler = decided_history_handler(store, 25);

        let response = handler(request(
            SyncProtocol::DecidedHistory,
            vec![Height(0), Height(1000)],
        ))
        .unwrap();
        let sm = SyncMessage::decode(&response.data).unwrap();

        assert_eq!(sm.status, Status::Success);
        assert!(sm.data.len() <= 26);
        assert_eq!(sm.params.heights, vec![Height(0), Height(25)]);
        let heights: Vec<u64> = sm.data.iter().map(|m| m.message.height.0).collect();
        let mut sorted = heights.clone();
        sorted.sort_unstable();
        assert_eq!(heights, sorted, "ascending heights");
        assert_eq!(heights.first(), Some(&0));
    }

    #[test]
    fn history_rejects_missing_range() {
        let store = Arc::new(InMemoryStore::new());
        let handler = decided_history_handler(store, 25);
        let response = handler(request(SyncProtocol::DecidedHistory, vec![])).unwrap();
        let sm = SyncMessage::decode(&response.data).unwrap();
        assert_eq!(sm.status, Status::BadRequest);
    }

    #[test]
    fn last_decided_returns_highest_or_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let handler = last_decided_handler(store.clone());

        let response = handler(request(SyncProtocol::LastDecided, vec![])).unwrap();
        let sm = SyncMessage::decode(&response.data).unwrap();
        assert_eq!(sm.status, Status::NotFound);

        store.save_highest_instance(&stored(7)).unwrap();
        let response = handler(request(SyncProtocol::LastDecided, vec![])).unwrap();
        let sm = SyncMessage::decode(&response.data).unwrap();
        assert_eq!(sm.status, Status::Success);
        assert_eq!(sm.data[0].message.height, Height(7));
        assert_eq!(sm.params.heights, vec![Height(7)]);
    }

    #[test]
    fn malformed_request_is_bad_request() {
        let store = Arc::new(InMemoryStore::new());
        let handler = last_decided_handler(store);
        let response = handler(SsvMessage {
            msg_type: SsvMsgType::Sync,
            msg_id: id(),
            fork_version: 0,
            data: vec![0xff, 0x00],
        })
        .unwrap();
        let sm = SyncMessage::decode(&response.data).unwrap();
        assert_eq!(sm.status, Status::BadRequest);
    }
}

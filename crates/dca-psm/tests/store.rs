//! Store round-trips and transactional behaviour.

use dca_psm::{
    decode, encode, Direction, Psm, PsmError, Rep, RepRegistry, Result, Role, StateKey, Store, SubState,
    PSM_BUCKET,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

const TAG: u8 = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProofRequestRep {
    key: StateKey,
    attributes: Vec<String>,
    accepted: bool,
}

impl Rep for ProofRequestRep {
    fn key(&self) -> &StateKey {
        &self.key
    }
    fn tag(&self) -> u8 {
        TAG
    }
    fn data(&self) -> Result<Vec<u8>> {
        encode(self)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn decode_proof_request(bytes: &[u8]) -> Result<Box<dyn Rep>> {
    Ok(Box::new(decode::<ProofRequestRep>(bytes)?))
}

fn registry() -> Arc<RepRegistry> {
    let reps = RepRegistry::new();
    reps.add(TAG, decode_proof_request);
    Arc::new(reps)
}

fn key(nonce: &str) -> StateKey {
    StateKey::new("7Ey4pJb1Tt3a3dmbqwLSzW", nonce)
}

#[test]
fn test_psm_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("agent.db"), registry()).unwrap();

    let mut psm = Psm::new(key("thread-1"), Role::Addressee, "connections/1.0");
    psm.pairwise_did = Some("Dc8ntVQNJYFdjHnZAm7yHW".into());
    psm.append(SubState::new(Direction::Received, "request", "id-1")).unwrap();
    psm.append(SubState::new(Direction::Sending, "response", "id-1")).unwrap();
    store.add_psm(&psm).unwrap();

    assert_eq!(store.get_psm(&psm.key).unwrap(), psm);
}

#[test]
fn test_rep_roundtrip_and_overwrite() {
    let store = Store::open_in_memory(registry()).unwrap();
    let mut rep = ProofRequestRep {
        key: key("thread-2"),
        attributes: vec!["email".into(), "name".into()],
        accepted: false,
    };
    store.add_rep(&rep).unwrap();
    assert_eq!(store.get_rep_as::<ProofRequestRep>(TAG, &rep.key).unwrap(), rep);

    rep.accepted = true;
    store.add_rep(&rep).unwrap();
    assert!(store.get_rep_as::<ProofRequestRep>(TAG, &rep.key).unwrap().accepted);
    assert_eq!(store.reps_by_tag(TAG).unwrap().len(), 1);
}

#[test]
fn test_not_found() {
    let store = Store::open_in_memory(registry()).unwrap();

    let err = store.get_psm(&key("missing")).unwrap_err();
    assert!(err.is_not_found());
    assert!(store.get_rep(TAG, &key("missing")).unwrap_err().is_not_found());
}

#[test]
fn test_unknown_rep_tag() {
    let store = Store::open_in_memory(Arc::new(RepRegistry::new())).unwrap();
    store.put("rep_3", &key("raw"), b"bytes").unwrap();
    assert!(matches!(store.get_rep(3, &key("raw")), Err(PsmError::UnknownRepTag(3))));
}

#[test]
fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");

    let store = Store::open(&path, registry()).unwrap();
    store
        .transact_psm(
            &key("t"),
            || Psm::new(key("t"), Role::Initiator, "trust_ping/1.0"),
            |psm| psm.append(SubState::new(Direction::Sending, "ping", "p1")),
        )
        .unwrap();
    store.close().unwrap();

    let store = Store::open(&path, registry()).unwrap();
    let psm = store.get_psm(&key("t")).unwrap();
    assert_eq!(psm.direction(), Some(Direction::Sending));
    assert_eq!(store.keys(PSM_BUCKET).unwrap(), vec![key("t")]);
}

#[test]
fn test_illegal_transition_writes_nothing() {
    let store = Store::open_in_memory(registry()).unwrap();
    let init = || Psm::new(key("t"), Role::Initiator, "connections/1.0");

    store
        .transact_psm(&key("t"), init, |psm| {
            psm.append(SubState::new(Direction::Sending, "request", "t"))?;
            psm.append(SubState::new(Direction::Waiting, "request", "t"))
        })
        .unwrap();

    let err = store
        .transact_psm(&key("t"), init, |psm| {
            psm.append(SubState::new(Direction::ReadyAck, "response", "t"))?;
            psm.append(SubState::new(Direction::Sending, "response", "t"))
        })
        .unwrap_err();
    assert!(matches!(err, PsmError::IllegalTransition { .. }));

    let psm = store.get_psm(&key("t")).unwrap();
    assert_eq!(psm.direction(), Some(Direction::Waiting));
    assert_eq!(psm.states.len(), 2);
}

#[test]
fn test_concurrent_transactions_keep_a_legal_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("agent.db"), registry()).unwrap());

    // Each thread tries to move the conversation one step along
    // Waiting -> Received -> Sending -> Waiting -> ...
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..20 {
                    let _ = store.transact_psm(
                        &key("busy"),
                        || Psm::new(key("busy"), Role::Initiator, "basicmessage/1.0"),
                        |psm| {
                            let next = match psm.direction() {
                                None | Some(Direction::Sending) => Direction::Waiting,
                                Some(Direction::Waiting) => Direction::Received,
                                _ => Direction::Sending,
                            };
                            psm.append(SubState::new(next, "message", "m"))
                        },
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let psm = store.get_psm(&key("busy")).unwrap();
    assert_eq!(psm.states.len(), 160);
    assert!(psm.is_legal_path());
}

#[test]
fn test_raw_payload_journal() {
    let store = Store::open_in_memory(registry()).unwrap();

    let first = store.add_raw_payload("/agent/a/b", b"one").unwrap();
    let second = store.add_raw_payload("/agent/a/c", b"two").unwrap();
    assert!(second > first);

    store.remove_raw_payload(first).unwrap();
    let pending = store.pending_raw_payloads().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second);
    assert_eq!(pending[0].address, "/agent/a/c");
    assert_eq!(pending[0].payload, b"two");
}

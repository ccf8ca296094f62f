//! End-to-end protocol runs.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use dca::pipe::{verify_stamp, LocalPackager, Packager, PipeError, SIGNATURE_EXPIRATION_SECS};
use dca::protocol::basic_message::BasicMessageStart;
use dca::protocol::connection::{
    signature, Connection, Invitation, PairwiseRep, Request, Response, PAIRWISE_TAG,
};
use dca::protocol::status::StatusDetails;
use dca::{
    registries, Addr, Agent, AgentConfig, AgentParts, Direction, IdentityKey, LoopbackTransport, Packet,
    PacketRouter, Payload, ProcessorRegistry, ProtocolError, ProtocolStart, Psm, RepRegistry, Role,
    ServiceAddr, StateKey, StatusEvent, StatusSubscription, Store, Transport, TransportError, Wallet,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONNECTIONS: &str = "https://didcomm.org/connections/1.0";
const TRUST_PING: &str = "https://didcomm.org/trust_ping/1.0";
const BASIC_MESSAGE: &str = "https://didcomm.org/basicmessage/1.0";

/// Transport that keeps what was sent instead of sending it.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, endpoint: &str, envelope: Vec<u8>) -> std::result::Result<Vec<u8>, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(endpoint.to_string()));
        }
        self.sent.lock().push((endpoint.to_string(), envelope));
        Ok(Vec::new())
    }
}

fn agent_with(
    transport: Arc<dyn Transport>,
    processors: Arc<ProcessorRegistry>,
    reps: Arc<RepRegistry>,
    config: AgentConfig,
) -> Arc<Agent> {
    Agent::new(
        config,
        IdentityKey::generate(),
        AgentParts {
            wallet: Arc::new(Wallet::new()),
            store: Arc::new(Store::open_in_memory(reps).unwrap()),
            processors,
            transport,
        },
    )
}

fn recording_agent(transport: Arc<RecordingTransport>) -> (Arc<Agent>, Arc<PacketRouter>) {
    let (processors, reps) = registries();
    let agent = agent_with(transport, processors.clone(), reps, AgentConfig::default());
    let router = Arc::new(PacketRouter::new(processors));
    router.register(agent.clone());
    (agent, router)
}

fn directions(psm: &Psm) -> Vec<Direction> {
    psm.states.iter().map(|s| s.direction).collect()
}

/// Server side address of a client URL.
fn server_addr(url: &str) -> Addr {
    let mut addr = Addr::from_client_url(url).unwrap();
    addr.base_path.clear();
    Addr::from_server_path(&addr.address())
}

/// Open an envelope with `agent`'s keys.
fn open(agent: &Agent, envelope: &[u8]) -> Payload {
    let unpacked = agent.packager().unpack(envelope).unwrap();
    Payload::from_bytes(&unpacked.message).unwrap()
}

async fn wait_for(sub: &mut StatusSubscription, pred: impl Fn(&StatusEvent) -> bool) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.next().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("status stream closed");
    })
    .await
    .expect("timed out waiting for status event")
}

#[tokio::test]
async fn test_initiator_waits_for_response() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, _) = recording_agent(transport.clone());

    // The recipient key has to be a real Ed25519 verkey; placeholders such
    // as "K1" are refused before anything is recorded.
    let k1 = IdentityKey::generate().verkey();
    let invitation = Invitation::new("inv-1", "peer", k1.clone(), "https://peer/x/ping");
    let key = agent
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "me".into(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(key, StateKey::new(agent.did(), "inv-1"));
    let psm = agent.engine().get_psm(&key).unwrap();
    assert_eq!(directions(&psm), vec![Direction::Sending, Direction::Waiting]);
    assert_eq!(psm.role, Role::Initiator);

    let rep: PairwiseRep = agent.store().get_rep_as(PAIRWISE_TAG, &key).unwrap();
    assert!(rep.caller.my);
    assert!(!rep.callee.my);
    assert_eq!(rep.their_label, "peer");
    assert_eq!(psm.pairwise_did.as_deref(), Some(rep.caller.did.as_str()));

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "https://peer/x/ping");
    assert_eq!(agent.connection_ids(), vec!["inv-1".to_string()]);
}

#[tokio::test]
async fn test_invitation_with_unusable_key_is_rejected() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, _) = recording_agent(transport.clone());

    let invitation = Invitation::new("inv-k1", "peer", "K1", "https://peer/x/ping");
    let err = agent
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "me".into(),
            }),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::Validation(_)));
    let key = StateKey::new(agent.did(), "inv-k1");
    assert!(agent.engine().get_psm(&key).unwrap_err().is_not_found());
    assert!(agent
        .store()
        .get_rep_as::<PairwiseRep>(PAIRWISE_TAG, &key)
        .unwrap_err()
        .is_not_found());
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_addressee_answers_request() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, router) = recording_agent(transport.clone());
    let invitation = agent.create_invitation("bob");

    // The other end, outside of any agent.
    let caller_wallet = Arc::new(Wallet::new());
    let caller = caller_wallet.new_identity();
    let caller_endpoint = ServiceAddr::new("http://initiator/a2a/x/x/pw", caller.verkey.clone());
    let request = Request {
        label: "alice".into(),
        connection: Connection::new(&caller, &caller_endpoint),
    };
    let payload = Payload::new(format!("{}/request", CONNECTIONS), Some(invitation.id.as_str()))
        .with_body(&request)
        .unwrap();

    router
        .process(Packet {
            payload,
            address: server_addr(&invitation.service_endpoint),
            receiver: agent.clone(),
        })
        .await
        .unwrap();

    let key = StateKey::new(agent.did(), invitation.id.as_str());
    let psm = agent.engine().get_psm(&key).unwrap();
    assert_eq!(
        directions(&psm),
        vec![Direction::Received, Direction::Sending, Direction::ReadyAck]
    );
    assert_eq!(psm.role, Role::Addressee);

    let rep: PairwiseRep = agent.store().get_rep_as(PAIRWISE_TAG, &key).unwrap();
    assert!(rep.callee.my);
    assert!(!rep.caller.my);
    assert_eq!(rep.caller.did, caller.did);
    assert_eq!(rep.name, invitation.id);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "http://initiator/a2a/x/x/pw");

    let caller_packager: Arc<dyn Packager> = Arc::new(LocalPackager::new(caller_wallet));
    let unpacked = caller_packager.unpack(&sent[0].1).unwrap();
    let reply = Payload::from_bytes(&unpacked.message).unwrap();
    assert_eq!(reply.thread_id(), invitation.id);
    assert_eq!(reply.type_, format!("{}/response", CONNECTIONS));

    let response: Response = reply.body_as().unwrap();
    let stamped = URL_SAFE.decode(&response.connection_sig.sig_data).unwrap();
    let now = chrono::Utc::now().timestamp();
    let (timestamp, _) = verify_stamp(&stamped, now).unwrap();
    assert!(now - timestamp <= SIGNATURE_EXPIRATION_SECS);

    let connection = signature::verify(&response.connection_sig, None, &caller_packager).unwrap();
    assert_eq!(connection.did, rep.callee.did);
    assert_eq!(
        agent.pipe(&invitation.id).unwrap().remote.endpoint.unwrap().endp,
        "http://initiator/a2a/x/x/pw"
    );
}

#[tokio::test]
async fn test_malformed_request_is_not_persisted() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, router) = recording_agent(transport.clone());
    let invitation = agent.create_invitation("bob");

    let payload = Payload::new(format!("{}/request", CONNECTIONS), Some(invitation.id.as_str()))
        .with_body(&serde_json::json!({ "label": "alice" }))
        .unwrap();
    let err = router
        .process(Packet {
            payload,
            address: server_addr(&invitation.service_endpoint),
            receiver: agent.clone(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::Validation(_)));
    let key = StateKey::new(agent.did(), invitation.id.as_str());
    assert!(agent.engine().get_psm(&key).unwrap_err().is_not_found());
    assert!(transport.sent().is_empty());
}

/// Run a connection by hand between two agents with recording transports
/// and return the initiator side with the response packet it received.
struct HandDriven {
    alice: Arc<Agent>,
    alice_router: Arc<PacketRouter>,
    key: StateKey,
    response: Packet,
}

async fn hand_driven_connection() -> HandDriven {
    let alice_out = Arc::new(RecordingTransport::default());
    let bob_out = Arc::new(RecordingTransport::default());
    let (alice, alice_router) = recording_agent(alice_out.clone());
    let (bob, bob_router) = recording_agent(bob_out.clone());

    let invitation = bob.create_invitation("bob");
    let key = alice
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "alice".into(),
            }),
        )
        .await
        .unwrap();

    let (endpoint, envelope) = alice_out.sent().remove(0);
    bob_router
        .process(Packet {
            payload: open(&bob, &envelope),
            address: server_addr(&endpoint),
            receiver: bob.clone(),
        })
        .await
        .unwrap();

    let (endpoint, envelope) = bob_out.sent().remove(0);
    let response = Packet {
        payload: open(&alice, &envelope),
        address: server_addr(&endpoint),
        receiver: alice.clone(),
    };
    HandDriven {
        alice,
        alice_router,
        key,
        response,
    }
}

#[tokio::test]
async fn test_initiator_completes_on_response() {
    let run = hand_driven_connection().await;
    run.alice_router.process(run.response).await.unwrap();

    let psm = run.alice.engine().get_psm(&run.key).unwrap();
    assert_eq!(
        directions(&psm),
        vec![
            Direction::Sending,
            Direction::Waiting,
            Direction::Received,
            Direction::ReadyAck
        ]
    );
    let rep: PairwiseRep = run.alice.store().get_rep_as(PAIRWISE_TAG, &run.key).unwrap();
    assert!(rep.caller.my);
    assert!(!rep.callee.did.is_empty());

    let status = run.alice.protocol_status(&run.key).unwrap();
    assert_eq!(status.state, Some(Direction::ReadyAck));
    match status.details {
        Some(StatusDetails::Connection(details)) => {
            assert_eq!(details.id, run.key.nonce);
            assert_eq!(details.my_did, rep.caller.did);
            assert_eq!(details.their_did, rep.callee.did);
            assert_eq!(details.their_label, "bob");
            assert!(details.their_endpoint.ends_with(&rep.callee.did));
        }
        other => panic!("unexpected details {:?}", other),
    }
}

#[tokio::test]
async fn test_tampered_response_fails_conversation() {
    let mut run = hand_driven_connection().await;
    let before: PairwiseRep = run.alice.store().get_rep_as(PAIRWISE_TAG, &run.key).unwrap();

    let mut response: Response = run.response.payload.body_as().unwrap();
    let mut sig = URL_SAFE.decode(&response.connection_sig.signature).unwrap();
    sig[0] ^= 0xff;
    response.connection_sig.signature = URL_SAFE.encode(sig);
    run.response.payload.set_body(&response).unwrap();

    let err = run.alice_router.process(run.response).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Crypto(PipeError::InvalidSignature)));

    let psm = run.alice.engine().get_psm(&run.key).unwrap();
    assert_eq!(
        directions(&psm),
        vec![Direction::Sending, Direction::Waiting, Direction::Failure]
    );
    assert!(psm.is_failed());
    let after: PairwiseRep = run.alice.store().get_rep_as(PAIRWISE_TAG, &run.key).unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_tampered_replay_keeps_finished_outcome() {
    let run = hand_driven_connection().await;
    let mut replay = run.response.clone();
    run.alice_router.process(run.response).await.unwrap();
    let before = run.alice.engine().get_psm(&run.key).unwrap();

    let mut response: Response = replay.payload.body_as().unwrap();
    let mut sig = URL_SAFE.decode(&response.connection_sig.signature).unwrap();
    sig[0] ^= 0xff;
    response.connection_sig.signature = URL_SAFE.encode(sig);
    replay.payload.set_body(&response).unwrap();

    let err = run.alice_router.process(replay).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Crypto(PipeError::InvalidSignature)));

    let after = run.alice.engine().get_psm(&run.key).unwrap();
    assert_eq!(after, before);
    assert!(after.is_ready());
}

#[tokio::test]
async fn test_unknown_protocol_is_configuration_error() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, router) = recording_agent(transport);

    let payload = Payload::new("https://didcomm.org/unknown/1.0/hello", None);
    let err = router
        .process(Packet {
            payload,
            address: Addr::default(),
            receiver: agent.clone(),
        })
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(matches!(err, ProtocolError::UnknownProtocol(_)));

    let payload = Payload::new(format!("{}/unknown", CONNECTIONS), None);
    let err = router
        .process(Packet {
            payload,
            address: Addr::default(),
            receiver: agent,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownMessage { .. }));
}

#[tokio::test]
async fn test_send_failure_keeps_sending_state() {
    let transport = Arc::new(RecordingTransport::failing());
    let (agent, _) = recording_agent(transport);

    let invitation = Invitation::new("inv-f", "peer", IdentityKey::generate().verkey(), "https://peer/x");
    let err = agent
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "me".into(),
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Transport(_)));

    let psm = agent.engine().get_psm(&StateKey::new(agent.did(), "inv-f")).unwrap();
    assert_eq!(directions(&psm), vec![Direction::Sending]);
}

#[tokio::test]
async fn test_resend_after_send_failure() {
    let transport = Arc::new(RecordingTransport::failing());
    let (agent, _) = recording_agent(transport.clone());

    let peer_wallet = Arc::new(Wallet::new());
    let peer = peer_wallet.new_identity();
    let invitation = Invitation::new("inv-r", "peer", peer.verkey.clone(), "https://peer/x");
    let err = agent
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "me".into(),
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Transport(_)));

    let key = StateKey::new(agent.did(), "inv-r");
    let psm = agent.engine().get_psm(&key).unwrap();
    assert_eq!(directions(&psm), vec![Direction::Sending]);
    let request_id = psm.states[0].payload_id.clone();

    // Still unreachable: nothing changes.
    assert!(matches!(agent.resend(&key).await, Err(ProtocolError::Transport(_))));
    assert_eq!(directions(&agent.engine().get_psm(&key).unwrap()), vec![Direction::Sending]);

    transport.set_failing(false);
    agent.resend(&key).await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "https://peer/x");
    let unpacked = LocalPackager::new(peer_wallet).unpack(&sent[0].1).unwrap();
    let request = Payload::from_bytes(&unpacked.message).unwrap();
    assert_eq!(request.id, request_id);
    assert_eq!(request.thread_id(), "inv-r");
    assert_eq!(request.type_, format!("{}/request", CONNECTIONS));

    let psm = agent.engine().get_psm(&key).unwrap();
    assert_eq!(directions(&psm), vec![Direction::Sending, Direction::Waiting]);
    assert_eq!(psm.last().unwrap().message_type, format!("{}/response", CONNECTIONS));

    // Only a run whose last step is Sending can be resent.
    let err = agent.resend(&key).await.unwrap_err();
    assert!(matches!(err, ProtocolError::State(_)));
    assert_eq!(transport.sent().len(), 1);
}

/// Agent whose store and keys live under `dir`.
fn durable_agent(
    dir: &std::path::Path,
    seed: &[u8; 32],
    transport: Arc<RecordingTransport>,
) -> (Arc<Agent>, Arc<PacketRouter>) {
    let (processors, reps) = registries();
    let agent = Agent::new(
        AgentConfig::default(),
        IdentityKey::from_bytes(seed),
        AgentParts {
            wallet: Arc::new(Wallet::new()),
            store: Arc::new(Store::open(dir.join("alice.db"), reps).unwrap()),
            processors: processors.clone(),
            transport,
        },
    );
    let router = Arc::new(PacketRouter::new(processors));
    router.register(agent.clone());
    (agent, router)
}

#[tokio::test]
async fn test_restart_while_waiting_completes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let seed = IdentityKey::generate().to_bytes();
    let alice_out = Arc::new(RecordingTransport::default());
    let bob_out = Arc::new(RecordingTransport::default());
    let (alice, alice_router) = durable_agent(dir.path(), &seed, alice_out.clone());
    let (bob, bob_router) = recording_agent(bob_out.clone());

    let key = alice
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation: bob.create_invitation("bob"),
                label: "alice".into(),
            }),
        )
        .await
        .unwrap();
    let (endpoint, envelope) = alice_out.sent().remove(0);
    bob_router
        .process(Packet {
            payload: open(&bob, &envelope),
            address: server_addr(&endpoint),
            receiver: bob.clone(),
        })
        .await
        .unwrap();
    drop(alice_router);
    drop(alice);

    let (alice, alice_router) = durable_agent(dir.path(), &seed, Arc::new(RecordingTransport::default()));
    assert_eq!(alice.wallet().len(), 1);
    assert_eq!(alice.restore_pipes().unwrap(), 1);
    assert_eq!(alice.wallet().len(), 2);
    assert!(alice.engine().get_psm(&key).unwrap().is_waiting());

    // The response is addressed to the pairwise key made before the restart.
    let (endpoint, envelope) = bob_out.sent().remove(0);
    alice_router
        .accept(&server_addr(&endpoint).address(), &envelope)
        .unwrap();
    assert_eq!(alice_router.recover_pending().await.unwrap(), 1);

    let psm = alice.engine().get_psm(&key).unwrap();
    assert_eq!(
        directions(&psm),
        vec![
            Direction::Sending,
            Direction::Waiting,
            Direction::Received,
            Direction::ReadyAck
        ]
    );
    let rep: PairwiseRep = alice.store().get_rep_as(PAIRWISE_TAG, &key).unwrap();
    assert_eq!(alice.pipe(&key.nonce).unwrap().remote.did, rep.callee.did);
}

#[tokio::test]
async fn test_resend_pending_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let seed = IdentityKey::generate().to_bytes();
    let peer_wallet = Arc::new(Wallet::new());
    let peer = peer_wallet.new_identity();

    let (alice, router) = durable_agent(dir.path(), &seed, Arc::new(RecordingTransport::failing()));
    let invitation = Invitation::new("inv-p", "peer", peer.verkey.clone(), "https://peer/x");
    alice
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "alice".into(),
            }),
        )
        .await
        .unwrap_err();
    drop(router);
    drop(alice);

    let transport = Arc::new(RecordingTransport::default());
    let (alice, _router) = durable_agent(dir.path(), &seed, transport.clone());
    alice.restore_pipes().unwrap();
    assert_eq!(alice.resend_pending().await.unwrap(), 1);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let unpacked = LocalPackager::new(peer_wallet).unpack(&sent[0].1).unwrap();
    assert_eq!(Payload::from_bytes(&unpacked.message).unwrap().thread_id(), "inv-p");
    let psm = alice.engine().get_psm(&StateKey::new(alice.did(), "inv-p")).unwrap();
    assert!(psm.is_waiting());
    assert_eq!(alice.resend_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recover_pending_payload() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, router) = recording_agent(transport.clone());
    let invitation = agent.create_invitation("bob");

    let caller_wallet = Arc::new(Wallet::new());
    let caller = caller_wallet.new_identity();
    let request = Request {
        label: "alice".into(),
        connection: Connection::new(&caller, &ServiceAddr::new("http://initiator/pw", caller.verkey.clone())),
    };
    let payload = Payload::new(format!("{}/request", CONNECTIONS), Some(invitation.id.as_str()))
        .with_body(&request)
        .unwrap();
    let envelope = LocalPackager::new(caller_wallet)
        .pack(
            &payload.to_bytes().unwrap(),
            &caller.verkey,
            &[agent.identity().verkey.clone()],
        )
        .unwrap();

    let path = server_addr(&invitation.service_endpoint).address();
    router.accept(&path, &envelope).unwrap();
    assert_eq!(agent.store().pending_raw_payloads().unwrap().len(), 1);

    assert_eq!(router.recover_pending().await.unwrap(), 1);
    assert!(agent.store().pending_raw_payloads().unwrap().is_empty());

    let psm = agent
        .engine()
        .get_psm(&StateKey::new(agent.did(), invitation.id.as_str()))
        .unwrap();
    assert!(psm.is_ready());
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn test_router_rejects_bad_addresses() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, router) = recording_agent(transport);

    let err = router.accept("/a2a/not-a-did/x/y", b"data").unwrap_err();
    assert!(matches!(err, ProtocolError::Validation(_)));

    let err = router.accept("/a2a/ping", b"data").unwrap_err();
    assert!(matches!(err, ProtocolError::Validation(_)));

    let stranger = IdentityKey::generate().did().to_string();
    let err = router
        .accept(&format!("/a2a/{0}/{0}/{0}", stranger), b"data")
        .unwrap_err();
    assert!(err.is_not_found());

    assert!(agent.store().pending_raw_payloads().unwrap().is_empty());
}

/// Two agents wired through one router with in-process delivery.
struct Network {
    alice: Arc<Agent>,
    bob: Arc<Agent>,
    connection_id: String,
    _router: Arc<PacketRouter>,
}

async fn connected(bob_auto_permission: bool) -> Network {
    let (processors, reps) = registries();
    let router = Arc::new(PacketRouter::new(processors.clone()));
    let loopback = Arc::new(LoopbackTransport::new());
    loopback.attach(&router);

    let alice = agent_with(loopback.clone(), processors.clone(), reps.clone(), AgentConfig::default());
    let bob = agent_with(
        loopback,
        processors,
        reps,
        AgentConfig {
            auto_permission: bob_auto_permission,
            ..AgentConfig::default()
        },
    );
    router.register(alice.clone());
    router.register(bob.clone());

    let mut alice_events = alice.subscribe();
    let invitation = bob.create_invitation("bob");
    let connection_id = invitation.id.clone();
    let key = alice
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "alice".into(),
            }),
        )
        .await
        .unwrap();
    wait_for(&mut alice_events, |e| e.key == key && e.direction == Direction::ReadyAck).await;

    Network {
        alice,
        bob,
        connection_id,
        _router: router,
    }
}

#[tokio::test]
async fn test_loopback_connection_ping_and_message() {
    let net = connected(true).await;
    assert_eq!(net.alice.connection_ids(), vec![net.connection_id.clone()]);
    assert_eq!(net.bob.connection_ids(), vec![net.connection_id.clone()]);

    let mut alice_events = net.alice.subscribe();
    let mut bob_events = net.bob.subscribe();
    let ping = net
        .alice
        .start_protocol(
            TRUST_PING,
            Role::Initiator,
            Some(ProtocolStart::TrustPing {
                connection_id: net.connection_id.clone(),
            }),
        )
        .await
        .unwrap();
    wait_for(&mut alice_events, |e| e.key == ping && e.direction == Direction::ReadyAck).await;
    let answered = wait_for(&mut bob_events, |e| {
        e.key.nonce == ping.nonce && e.direction == Direction::ReadyAck
    })
    .await;

    let psm = net.bob.engine().get_psm(&answered.key).unwrap();
    assert_eq!(
        directions(&psm),
        vec![Direction::Received, Direction::Sending, Direction::ReadyAck]
    );

    let message = net
        .alice
        .start_protocol(
            BASIC_MESSAGE,
            Role::Initiator,
            Some(ProtocolStart::BasicMessage(BasicMessageStart {
                connection_id: net.connection_id.clone(),
                content: "hello bob".into(),
            })),
        )
        .await
        .unwrap();
    let event = wait_for(&mut bob_events, |e| {
        e.key.nonce == message.nonce && e.direction == Direction::ReadyAck
    })
    .await;

    let status = net.bob.protocol_status(&event.key).unwrap();
    match status.details {
        Some(StatusDetails::BasicMessage(details)) => {
            assert_eq!(details.content, "hello bob");
            assert_eq!(details.connection_id, net.connection_id);
            assert!(!details.sent_by_me);
        }
        other => panic!("unexpected details {:?}", other),
    }
    let status = net.alice.protocol_status(&message).unwrap();
    assert_eq!(status.state, Some(Direction::ReadyAck));
}

async fn parked_ping(net: &Network) -> (StateKey, StateKey) {
    let mut bob_events = net.bob.subscribe();
    let ping = net
        .alice
        .start_protocol(
            TRUST_PING,
            Role::Initiator,
            Some(ProtocolStart::TrustPing {
                connection_id: net.connection_id.clone(),
            }),
        )
        .await
        .unwrap();
    let parked = wait_for(&mut bob_events, |e| {
        e.key.nonce == ping.nonce && e.direction == Direction::Waiting
    })
    .await;
    (ping, parked.key)
}

#[tokio::test]
async fn test_declined_ping_sends_nack() {
    let net = connected(false).await;
    let (ping, parked) = parked_ping(&net).await;

    let mut alice_events = net.alice.subscribe();
    net.bob.continue_protocol(&parked, false).await.unwrap();

    let psm = net.bob.engine().get_psm(&parked).unwrap();
    assert_eq!(
        directions(&psm),
        vec![Direction::Received, Direction::Waiting, Direction::Nack]
    );
    wait_for(&mut alice_events, |e| e.key == ping && e.direction == Direction::Nack).await;

    // A finished run cannot be continued again.
    let err = net.bob.continue_protocol(&parked, true).await.unwrap_err();
    assert!(matches!(err, ProtocolError::State(_)));
}

#[tokio::test]
async fn test_accepted_ping_is_answered() {
    let net = connected(false).await;
    let (ping, parked) = parked_ping(&net).await;

    let mut alice_events = net.alice.subscribe();
    net.bob.continue_protocol(&parked, true).await.unwrap();

    let psm = net.bob.engine().get_psm(&parked).unwrap();
    assert_eq!(
        directions(&psm),
        vec![
            Direction::Received,
            Direction::Waiting,
            Direction::Sending,
            Direction::ReadyAck
        ]
    );
    wait_for(&mut alice_events, |e| e.key == ping && e.direction == Direction::ReadyAck).await;
}

#[tokio::test]
async fn test_restore_pipes_from_store() {
    let transport = Arc::new(RecordingTransport::default());
    let (processors, reps) = registries();
    let wallet = Arc::new(Wallet::new());
    let store = Arc::new(Store::open_in_memory(reps).unwrap());
    let key_bytes = IdentityKey::generate().to_bytes();
    let parts = || AgentParts {
        wallet: wallet.clone(),
        store: store.clone(),
        processors: processors.clone(),
        transport: transport.clone(),
    };

    let agent = Agent::new(AgentConfig::default(), IdentityKey::from_bytes(&key_bytes), parts());
    let router = Arc::new(PacketRouter::new(processors.clone()));
    router.register(agent.clone());
    let invitation = agent.create_invitation("bob");

    let caller_wallet = Arc::new(Wallet::new());
    let caller = caller_wallet.new_identity();
    let request = Request {
        label: "alice".into(),
        connection: Connection::new(&caller, &ServiceAddr::new("http://initiator/pw", caller.verkey.clone())),
    };
    let payload = Payload::new(format!("{}/request", CONNECTIONS), Some(invitation.id.as_str()))
        .with_body(&request)
        .unwrap();
    router
        .process(Packet {
            payload,
            address: server_addr(&invitation.service_endpoint),
            receiver: agent.clone(),
        })
        .await
        .unwrap();

    let restarted = Agent::new(AgentConfig::default(), IdentityKey::from_bytes(&key_bytes), parts());
    assert!(restarted.connection_ids().is_empty());
    assert_eq!(restarted.restore_pipes().unwrap(), 1);

    let pipe = restarted.pipe(&invitation.id).unwrap();
    assert_eq!(pipe.remote.did, caller.did);
    let local_did = pipe.local.as_ref().map(|l| l.did.clone()).unwrap();
    let (connection_id, _) = restarted.pipe_by_pairwise(&local_did).unwrap();
    assert_eq!(connection_id, invitation.id);
}

#[tokio::test]
async fn test_status_subscription_cancel() {
    let transport = Arc::new(RecordingTransport::default());
    let (agent, _) = recording_agent(transport);
    let mut kept = agent.subscribe();
    let mut cancelled = agent.subscribe();
    cancelled.cancel();

    let invitation = Invitation::new("inv-s", "peer", IdentityKey::generate().verkey(), "https://peer/x");
    agent
        .start_protocol(
            CONNECTIONS,
            Role::Initiator,
            Some(ProtocolStart::Connection {
                invitation,
                label: "me".into(),
            }),
        )
        .await
        .unwrap();

    assert!(cancelled.next().await.is_none());
    assert_eq!(kept.next().await.unwrap().direction, Direction::Sending);
    assert_eq!(kept.next().await.unwrap().direction, Direction::Waiting);

    agent.close_streams();
    assert!(kept.next().await.is_none());
}

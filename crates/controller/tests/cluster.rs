//! End-to-end scenarios on an in-memory four-operator cluster.

use async_trait::async_trait;
use dvq_controller::{
    Controller, ControllerOptions, ForkVersion, Network, NetworkError, PeerId, StreamHandler,
    SyncConfig, ValidationResult,
};
use dvq_messages::{
    aggregate_messages, CommitData, Message, MessageType, PrepareData, SignedMessage, SsvMessage,
};
use dvq_qbft::{
    BroadcastError, Broadcaster, InMemoryStore, InstanceConfig, QbftStore, Stage, StorageError,
};
use dvq_types::{
    Height, KeyPair, LocalKeyManager, MessageId, Operator, OperatorId, Role, Round, Share,
    SignatureBytes, ValidatorPublicKey, DOMAIN_PRIMARY_NET,
};
use parking_lot::Mutex;
use ssz::Encode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const VALUE: &[u8] = &[0x01, 0x02, 0x03, 0x04];
const GENESIS_WIRE: u64 = 0;

/// Routes broadcasts to every registered controller and requests to the
/// target node's stream handlers.
#[derive(Default)]
struct Hub {
    nodes: Mutex<Vec<(PeerId, Controller)>>,
    handlers: Mutex<HashMap<(String, String), StreamHandler>>,
}

impl Hub {
    fn attach(&self, peer: PeerId, controller: Controller) {
        self.nodes.lock().push((peer, controller));
    }

    fn deliver(&self, msg: SsvMessage) {
        let nodes: Vec<Controller> = self
            .nodes
            .lock()
            .iter()
            .map(|(_, c)| c.clone())
            .collect();
        for node in nodes {
            let _ = node.process_msg(msg.clone());
        }
    }
}

struct NodeNet {
    hub: Arc<Hub>,
    peer: PeerId,
}

impl Broadcaster for NodeNet {
    fn broadcast(&self, msg: SsvMessage) -> Result<(), BroadcastError> {
        self.hub.deliver(msg);
        Ok(())
    }
}

#[async_trait]
impl Network for NodeNet {
    fn subscribe(&self, _validator_pk: &ValidatorPublicKey) -> Result<(), NetworkError> {
        Ok(())
    }

    fn unsubscribe(&self, _validator_pk: &ValidatorPublicKey) -> Result<(), NetworkError> {
        Ok(())
    }

    fn broadcast_decided(&self, msg: SsvMessage) -> Result<(), NetworkError> {
        self.hub.deliver(msg);
        Ok(())
    }

    fn peers(&self, _validator_pk: &ValidatorPublicKey) -> Vec<PeerId> {
        self.hub
            .nodes
            .lock()
            .iter()
            .map(|(p, _)| p.clone())
            .filter(|p| *p != self.peer)
            .collect()
    }

    async fn request(
        &self,
        peer: &PeerId,
        protocol: &str,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkError> {
        let handler = self
            .hub
            .handlers
            .lock()
            .get(&(peer.0.clone(), protocol.to_string()))
            .cloned()
            .ok_or_else(|| NetworkError::PeerUnreachable(peer.clone()))?;
        let request = SsvMessage::decode(&data)
            .map_err(|e| NetworkError::Protocol(format!("bad request: {e}")))?;
        let response = handler(request)?;
        Ok(response.encode())
    }

    fn register_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.hub
            .handlers
            .lock()
            .insert((self.peer.0.clone(), protocol.to_string()), handler);
    }

    fn report_validation(&self, _msg: &SsvMessage, _result: ValidationResult) {}
}

struct TestNode {
    controller: Controller,
    store: Arc<InMemoryStore>,
}

struct Cluster {
    hub: Arc<Hub>,
    nodes: Vec<TestNode>,
    kps: Vec<KeyPair>,
    id: MessageId,
    shares: Vec<Arc<Share>>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}

/// A committee of `committee_n` operators, of which the first `nodes_n`
/// actually run controllers.
fn build_cluster(
    committee_n: u64,
    nodes_n: u64,
    round_timeout: Duration,
    min_peers: usize,
) -> Cluster {
    init_tracing();
    let kps: Vec<KeyPair> = (0..committee_n).map(|_| KeyPair::generate()).collect();
    let committee: Vec<Operator> = kps
        .iter()
        .enumerate()
        .map(|(i, kp)| Operator {
            id: OperatorId(i as u64 + 1),
            public_key: kp.public_key().clone(),
        })
        .collect();
    let validator_pk = [0x42u8; 48];
    let id = MessageId::new(&validator_pk, Role::Attester);
    let hub = Arc::new(Hub::default());

    let mut nodes = Vec::new();
    let mut shares = Vec::new();
    for i in 0..nodes_n {
        let share = Arc::new(Share {
            operator_id: OperatorId(i + 1),
            validator_pk,
            committee: committee.clone(),
        });
        shares.push(Arc::clone(&share));
        let peer = PeerId(format!("operator-{}", i + 1));
        let net = Arc::new(NodeNet {
            hub: Arc::clone(&hub),
            peer: peer.clone(),
        });
        let store = Arc::new(InMemoryStore::new());
        let controller = Controller::new(ControllerOptions {
            identifier: id,
            share,
            network: net,
            storage: store.clone() as Arc<dyn QbftStore>,
            key_manager: Arc::new(LocalKeyManager::with_share(kps[i as usize].clone())),
            domain: DOMAIN_PRIMARY_NET,
            fork: ForkVersion::Genesis,
            instance_config: InstanceConfig {
                round_timeout_base: round_timeout,
                round_timeout_max_exponent: 6,
                late_commit_grace: Duration::from_secs(10),
            },
            sync: SyncConfig {
                request_timeout: Duration::from_secs(2),
                ..SyncConfig::default()
            },
            min_peers,
            full_node: true,
            workers: 2,
            queue_capacity: 1024,
            decided_handler: None,
        });
        hub.attach(peer, controller.clone());
        nodes.push(TestNode { controller, store });
    }

    Cluster {
        hub,
        nodes,
        kps,
        id,
        shares,
    }
}

async fn init_all(cluster: &Cluster) {
    let inits = cluster.nodes.iter().map(|n| n.controller.init());
    for result in futures::future::join_all(inits).await {
        result.expect("controller init");
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn sign_message(kps: &[KeyPair], signer: u64, message: Message) -> SignedMessage {
    let mut sm = SignedMessage {
        signature: SignatureBytes::ZERO,
        signers: vec![OperatorId(signer)],
        message,
    };
    let root = sm.signing_root(DOMAIN_PRIMARY_NET);
    sm.signature = kps[(signer - 1) as usize].sign(&root).into();
    sm
}

fn commit_msg(cluster: &Cluster, signer: u64, height: u64, round: u64) -> SignedMessage {
    sign_message(
        &cluster.kps,
        signer,
        Message {
            msg_type: MessageType::Commit,
            height: Height(height),
            round: Round(round),
            identifier: cluster.id,
            data: CommitData {
                data: VALUE.to_vec(),
            }
            .as_ssz_bytes(),
        },
    )
}

/// A properly aggregated decided certificate from the given signers.
fn decided_cert(cluster: &Cluster, height: u64, signers: &[u64]) -> SignedMessage {
    let fragments: Vec<SignedMessage> = signers
        .iter()
        .map(|s| commit_msg(cluster, *s, height, 1))
        .collect();
    aggregate_messages(&fragments).expect("aggregation of disjoint commits")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_decides_at_round_one() {
    let cluster = build_cluster(4, 4, Duration::from_millis(500), 3);
    init_all(&cluster).await;

    let starts = cluster
        .nodes
        .iter()
        .map(|n| n.controller.clone())
        .map(|c| tokio::spawn(async move { c.start_instance(Height(0), VALUE.to_vec()).await }));
    // Some instances may be stopped by a faster peer's decided certificate;
    // the storage assertions below are the ground truth.
    let _ = futures::future::join_all(starts).await;

    for node in &cluster.nodes {
        let store = node.store.clone();
        wait_until("decided certificate in storage", || {
            store
                .get_highest_instance(&cluster.id)
                .unwrap()
                .is_some_and(|si| si.state.decided)
        })
        .await;

        let stored = node.store.get_highest_instance(&cluster.id).unwrap().unwrap();
        assert_eq!(stored.state.height, Height(0));
        assert_eq!(stored.state.round, Round(1));
        assert!(stored.state.decided);
        assert_eq!(stored.state.decided_value.as_deref(), Some(VALUE));
        assert!(stored.decided_message.signers.len() >= 3);

        // The aggregated signature verifies under the signers' keys.
        let share = &cluster.shares[0];
        let pks = share.public_keys(&stored.decided_message.signers).unwrap();
        let sig = stored.decided_message.signature.to_signature().unwrap();
        let root = stored.decided_message.signing_root(DOMAIN_PRIMARY_NET);
        assert!(sig.fast_aggregate_verify(&root, &pks));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_change_elects_second_leader() {
    let cluster = build_cluster(4, 4, Duration::from_millis(250), 3);
    init_all(&cluster).await;

    // Operators 1 and 2 act immediately; 3 and 4 are delayed past the
    // round-1 timeout, so everyone enters ROUND-CHANGE and operator 2
    // leads round 2.
    let mut tasks = Vec::new();
    for (i, node) in cluster.nodes.iter().enumerate() {
        let controller = node.controller.clone();
        tasks.push(tokio::spawn(async move {
            if i >= 2 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            controller.start_instance(Height(0), VALUE.to_vec()).await
        }));
    }
    let _ = futures::future::join_all(tasks).await;

    for node in &cluster.nodes {
        let store = node.store.clone();
        wait_until("round-2 decision in storage", || {
            store
                .get_highest_instance(&cluster.id)
                .unwrap()
                .is_some_and(|si| si.state.decided)
        })
        .await;

        let stored = node.store.get_highest_instance(&cluster.id).unwrap().unwrap();
        assert_eq!(stored.state.round, Round(2));
        assert!(stored.state.decided);
        assert_eq!(stored.state.decided_value.as_deref(), Some(VALUE));
    }

    // The round-2 proposal came from operator 2 alone. Instances that were
    // stopped by a peer's decided certificate never saw it; check the ones
    // that decided on their own.
    let mut checked = 0;
    for node in &cluster.nodes {
        let Some(instance) = node.controller.current_instance() else {
            continue;
        };
        let guard = instance.lock();
        if !guard.is_decided() {
            continue;
        }
        let proposals = guard.messages_by_round(MessageType::Proposal, Round(2));
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].signers, vec![OperatorId(2)]);
        checked += 1;
    }
    assert!(checked > 0, "at least one instance decided on its own");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_commit_extends_stored_certificate() {
    let cluster = build_cluster(4, 4, Duration::from_millis(500), 3);
    init_all(&cluster).await;

    // Only operators 1-3 run the duty; operator 4 stays silent.
    let starts = cluster.nodes[..3]
        .iter()
        .map(|n| n.controller.clone())
        .map(|c| tokio::spawn(async move { c.start_instance(Height(0), VALUE.to_vec()).await }));
    let _ = futures::future::join_all(starts).await;

    let node1 = &cluster.nodes[0];
    wait_until("three-signer decision", || {
        node1
            .store
            .get_highest_instance(&cluster.id)
            .unwrap()
            .is_some_and(|si| si.state.decided)
    })
    .await;
    let before = node1.store.get_highest_instance(&cluster.id).unwrap().unwrap();
    assert_eq!(before.decided_message.signers.len(), 3);

    // Operator 4's commit arrives after the fact.
    let late = commit_msg(&cluster, 4, 0, 1);
    node1
        .controller
        .process_msg(SsvMessage::consensus(cluster.id, &late, GENESIS_WIRE))
        .unwrap();

    let store = node1.store.clone();
    wait_until("certificate grows to four signers", || {
        store
            .get_highest_instance(&cluster.id)
            .unwrap()
            .is_some_and(|si| si.decided_message.signers.len() == 4)
    })
    .await;

    let after = node1.store.get_highest_instance(&cluster.id).unwrap().unwrap();
    let share = &cluster.shares[0];
    let pks = share.public_keys(&after.decided_message.signers).unwrap();
    let sig = after.decided_message.signature.to_signature().unwrap();
    let root = after.decided_message.signing_root(DOMAIN_PRIMARY_NET);
    assert!(sig.fast_aggregate_verify(&root, &pks));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn future_messages_trigger_highest_decided_sync() {
    let cluster = build_cluster(4, 2, Duration::from_millis(500), 1);
    let local = &cluster.nodes[0];
    let remote = &cluster.nodes[1];

    // The local operator resumes from height 5.
    let seed = decided_cert(&cluster, 5, &[1, 2, 3]);
    local
        .store
        .save_highest_instance(&dvq_qbft::StoredInstance {
            state: dvq_qbft::InstanceState {
                identifier: cluster.id,
                height: Height(5),
                round: Round(1),
                stage: Stage::Decided,
                prepared_round: Some(Round(1)),
                prepared_value: Some(VALUE.to_vec()),
                proposal_accepted_for_current_round: None,
                decided: true,
                decided_value: Some(VALUE.to_vec()),
            },
            decided_message: seed,
        })
        .unwrap();

    init_all(&cluster).await;
    assert_eq!(local.controller.height(), Height(5));

    // A peer is already at height 9.
    let ahead = decided_cert(&cluster, 9, &[1, 2, 3]);
    remote
        .store
        .save_highest_instance(&dvq_qbft::StoredInstance {
            state: dvq_qbft::InstanceState {
                identifier: cluster.id,
                height: Height(9),
                round: Round(1),
                stage: Stage::Decided,
                prepared_round: Some(Round(1)),
                prepared_value: Some(VALUE.to_vec()),
                proposal_accepted_for_current_round: None,
                decided: true,
                decided_value: Some(VALUE.to_vec()),
            },
            decided_message: ahead,
        })
        .unwrap();

    // f+1 = 2 distinct signers report height 10: the first only buffers,
    // the second triggers a highest-decided sync.
    for signer in [2u64, 3] {
        let future = sign_message(
            &cluster.kps,
            signer,
            Message {
                msg_type: MessageType::Prepare,
                height: Height(10),
                round: Round(1),
                identifier: cluster.id,
                data: PrepareData {
                    data: VALUE.to_vec(),
                }
                .as_ssz_bytes(),
            },
        );
        local
            .controller
            .process_msg(SsvMessage::consensus(cluster.id, &future, GENESIS_WIRE))
            .unwrap();
    }

    let controller = local.controller.clone();
    wait_until("height advances to the peer's decision", || {
        controller.height() == Height(9)
    })
    .await;
    wait_until("future buffer cleared", || {
        controller.future_msg_count() == 0
    })
    .await;

    let stored = local.store.get_highest_instance(&cluster.id).unwrap().unwrap();
    assert_eq!(stored.state.height, Height(9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_transition_stops_instance_and_returns_ready() {
    let cluster = build_cluster(4, 4, Duration::from_secs(5), 3);
    init_all(&cluster).await;

    // Run one full decision so a current instance exists.
    let starts = cluster
        .nodes
        .iter()
        .map(|n| n.controller.clone())
        .map(|c| tokio::spawn(async move { c.start_instance(Height(0), VALUE.to_vec()).await }));
    let _ = futures::future::join_all(starts).await;

    let controller = &cluster.nodes[0].controller;
    controller.on_fork(ForkVersion::V1).await.unwrap();
    assert_eq!(
        controller.state(),
        dvq_controller::ControllerState::Ready
    );
    assert!(controller.current_instance().is_none());
}

/// Storage whose decided-certificate writes always fail; reads and
/// checkpoints delegate to an in-memory store.
struct FailingStore {
    inner: InMemoryStore,
}

impl QbftStore for FailingStore {
    fn save_instance(&self, _instance: &dvq_qbft::StoredInstance) -> Result<(), StorageError> {
        Err(StorageError::Unreachable("disk gone".into()))
    }

    fn save_highest_instance(
        &self,
        _instance: &dvq_qbft::StoredInstance,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unreachable("disk gone".into()))
    }

    fn get_highest_instance(
        &self,
        identifier: &MessageId,
    ) -> Result<Option<dvq_qbft::StoredInstance>, StorageError> {
        self.inner.get_highest_instance(identifier)
    }

    fn get_instances_in_range(
        &self,
        identifier: &MessageId,
        from: Height,
        to: Height,
    ) -> Result<Vec<dvq_qbft::StoredInstance>, StorageError> {
        self.inner.get_instances_in_range(identifier, from, to)
    }

    fn clean_all_instances(&self, identifier: &MessageId) -> Result<(), StorageError> {
        self.inner.clean_all_instances(identifier)
    }

    fn save_current_instance(
        &self,
        identifier: &MessageId,
        state: &dvq_qbft::InstanceState,
    ) -> Result<(), StorageError> {
        self.inner.save_current_instance(identifier, state)
    }

    fn save_last_change_round(&self, msg: &SignedMessage) -> Result<(), StorageError> {
        self.inner.save_last_change_round(msg)
    }

    fn get_last_change_round(
        &self,
        identifier: &MessageId,
    ) -> Result<Vec<SignedMessage>, StorageError> {
        self.inner.get_last_change_round(identifier)
    }

    fn clean_last_change_round(&self, identifier: &MessageId) -> Result<(), StorageError> {
        self.inner.clean_last_change_round(identifier)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_storage_failure_goes_quiescent() {
    init_tracing();
    // A single-operator committee decides instantly; the interesting part
    // is the persistence failure afterwards.
    let kp = KeyPair::generate();
    let committee = vec![Operator {
        id: OperatorId(1),
        public_key: kp.public_key().clone(),
    }];
    let validator_pk = [0x43u8; 48];
    let id = MessageId::new(&validator_pk, Role::Attester);
    let share = Arc::new(Share {
        operator_id: OperatorId(1),
        validator_pk,
        committee,
    });
    let hub = Arc::new(Hub::default());
    let net = Arc::new(NodeNet {
        hub: Arc::clone(&hub),
        peer: PeerId("operator-1".into()),
    });
    let controller = Controller::new(ControllerOptions {
        identifier: id,
        share,
        network: net,
        storage: Arc::new(FailingStore {
            inner: InMemoryStore::new(),
        }),
        key_manager: Arc::new(LocalKeyManager::with_share(kp)),
        domain: DOMAIN_PRIMARY_NET,
        fork: ForkVersion::Genesis,
        instance_config: InstanceConfig {
            round_timeout_base: Duration::from_secs(2),
            round_timeout_max_exponent: 6,
            late_commit_grace: Duration::from_secs(10),
        },
        sync: SyncConfig::default(),
        min_peers: 0,
        full_node: true,
        workers: 2,
        queue_capacity: 64,
        decided_handler: None,
    });
    hub.attach(PeerId("operator-1".into()), controller.clone());

    controller.init().await.expect("init");
    assert!(controller.health_check());

    // The decision succeeds; persisting it cannot.
    let result = controller.start_instance(Height(0), VALUE.to_vec()).await;
    assert!(result.is_err(), "persist failure must surface");

    wait_until("controller goes quiescent", || {
        !controller.health_check()
    })
    .await;
    assert_eq!(
        controller.state(),
        dvq_controller::ControllerState::Quiescent
    );

    // Quiescent refuses new work and re-initialization.
    assert!(matches!(
        controller.start_instance(Height(1), VALUE.to_vec()).await,
        Err(dvq_controller::ControllerError::Quiescent)
    ));
    assert!(matches!(
        controller.init().await,
        Err(dvq_controller::ControllerError::Quiescent)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_mismatch_is_rejected_and_drives_transition() {
    let cluster = build_cluster(4, 1, Duration::from_secs(2), 0);
    init_all(&cluster).await;
    let controller = &cluster.nodes[0].controller;
    assert_eq!(controller.fork_version(), ForkVersion::Genesis);

    // An envelope stamped for the next fork is fatal at the queue level...
    let msg = sign_message(
        &cluster.kps,
        2,
        Message {
            msg_type: MessageType::Prepare,
            height: Height(0),
            round: Round(1),
            identifier: cluster.id,
            data: PrepareData {
                data: VALUE.to_vec(),
            }
            .as_ssz_bytes(),
        },
    );
    let v1_wire = ForkVersion::V1.wire();
    let result = controller.process_msg(SsvMessage::consensus(cluster.id, &msg, v1_wire));
    assert!(matches!(
        result,
        Err(dvq_controller::ControllerError::ForkMismatch { got }) if got == v1_wire
    ));

    // ...and pulls the controller through the fork transition.
    wait_until("fork transition to V1", || {
        controller.fork_version() == ForkVersion::V1
            && controller.state() == dvq_controller::ControllerState::Ready
    })
    .await;

    // Messages stamped for the new fork now flow.
    controller
        .process_msg(SsvMessage::consensus(cluster.id, &msg, v1_wire))
        .expect("current-fork message accepted");

    // Tags from forks this build does not know are dropped, not adopted.
    let unknown = controller.process_msg(SsvMessage::consensus(cluster.id, &msg, 99));
    assert!(matches!(
        unknown,
        Err(dvq_controller::ControllerError::ForkMismatch { got: 99 })
    ));
    assert_eq!(controller.fork_version(), ForkVersion::V1);
}

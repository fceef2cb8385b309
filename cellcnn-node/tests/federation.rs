//! Federated training over in-process trees on the simulated backend.

use std::sync::Arc;
use std::time::Duration;

use cellcnn::rng::party_rng;
use cellcnn::{
    synthetic_dataset, Batch, CellCnn, CnnConfig, CnnError, ConfigError, ErrorKind, Matrix, Sample,
};
use cellcnn_ckks::simulated::SimSecretKey;
use cellcnn_ckks::SimulatedCkks;
use cellcnn_node::{
    collective_setup, tree, Federation, Frame, IterationMsg, MessageType, Party, SessionConfig,
    SessionError, TrainingReport,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tiny_config(parties: usize) -> CnnConfig {
    CnnConfig {
        cells: 2,
        features: 4,
        filters: 2,
        classes: 2,
        batch_size: 2,
        samples: 1,
        epochs: 3,
        log_n: 8,
        log_slots: 7,
        levels: 11,
        deterministic: true,
        seed: 17,
        n_parties: parties,
        ..CnnConfig::default()
    }
}

fn session(parties: usize, fan_out: usize) -> SessionConfig {
    SessionConfig {
        parties,
        fan_out,
        timeout: Duration::from_secs(30),
        ..SessionConfig::default()
    }
}

fn sample() -> Sample {
    let config = tiny_config(1);
    synthetic_dataset(&config, &mut StdRng::seed_from_u64(42)).remove(0)
}

fn scheme(config: &CnnConfig) -> SimulatedCkks {
    SimulatedCkks::new(config.ckks_parameters().unwrap())
}

async fn federate(session: SessionConfig) -> TrainingReport {
    let config = tiny_config(session.parties);
    let shards = vec![vec![sample()]; session.parties];
    Federation::start(scheme(&config), config, session, shards)
        .unwrap()
        .wait()
        .await
        .unwrap()
}

fn close(a: &Option<Matrix>, b: &Option<Matrix>) -> f64 {
    a.as_ref().unwrap().max_abs_diff(b.as_ref().unwrap()).unwrap()
}

/// Party `id` of a `parties`-node tree on its own, plus the other
/// endpoints for the test to drive.
fn lone_party(
    id: usize,
    parties: usize,
    timeout: Duration,
) -> (Party<SimulatedCkks>, Vec<cellcnn_node::Endpoint>, cellcnn_node::DoneSignal, SimSecretKey) {
    let config = tiny_config(parties);
    let (ctx, sk) = collective_setup(scheme(&config), &config, parties).unwrap();
    let (mut endpoints, done) = tree(parties, 2);
    let endpoint = endpoints.remove(id);
    let model = CellCnn::new(config.clone(), Arc::new(ctx), party_rng(&config, id)).unwrap();
    let session = SessionConfig {
        timeout,
        ..session(parties, 2)
    };
    let party = Party::new(model, vec![sample()], endpoint, sk.clone(), session).unwrap();
    (party, endpoints, done, sk)
}

// ─── Aggregation ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_shards_match_single_party() {
    init_logging();
    let single = federate(session(1, 2)).await;
    assert_eq!(single.iterations, 2);
    assert!(close(&single.c, &single.decrypted_c) < 2f64.powi(-8));
    assert!(close(&single.w, &single.decrypted_w) < 2f64.powi(-8));

    // each party contributes lr / p of the gradient on the same sample
    for (parties, fan_out) in [(2, 2), (3, 1), (4, 2)] {
        let report = federate(session(parties, fan_out)).await;
        assert_eq!(report.iterations, 2);
        let tol = 2f64.powi(-8);
        assert!(close(&report.c, &single.c) < tol, "{} parties", parties);
        assert!(close(&report.w, &single.w) < tol, "{} parties", parties);
        assert!(close(&report.decrypted_c, &single.c) < tol, "{} parties", parties);
        assert!(close(&report.decrypted_w, &single.w) < tol, "{} parties", parties);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encrypted_only_session() {
    init_logging();
    let reference = federate(session(1, 2)).await;
    let encrypted = federate(SessionConfig {
        train_plain: false,
        ..session(2, 2)
    })
    .await;
    assert!(encrypted.c.is_none());
    assert!(close(&encrypted.decrypted_c, &reference.c) < 2f64.powi(-8));
    assert!(close(&encrypted.decrypted_w, &reference.w) < 2f64.powi(-8));
}

// ─── Malformed messages ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_root_drops_malformed_contribution() {
    init_logging();
    let (root, mut endpoints, _done, _) = lone_party(0, 2, Duration::from_secs(30));
    let mut child = endpoints.pop().unwrap();
    let task = tokio::spawn(root.run());

    let t = Duration::from_secs(30);
    child.expect_from_parent(MessageType::Sync, t).await.unwrap();
    child.send_to_parent(&Frame::new(MessageType::Sync, vec![])).unwrap();

    for n in 0..2 {
        let frame = child.expect_from_parent(MessageType::Iteration, t).await.unwrap();
        assert_eq!(IterationMsg::decode(&frame.payload).unwrap().n, n);
        child
            .send_to_parent(&Frame::new(MessageType::LocalGradient, vec![0xff, 0xff]))
            .unwrap();
    }
    let last = child.expect_from_parent(MessageType::Iteration, t).await.unwrap();
    assert_eq!(IterationMsg::decode(&last.payload).unwrap().n, 2);

    let report = task.await.unwrap().unwrap().unwrap();

    // the root's own half-step, twice, with momentum
    let config = tiny_config(2);
    let (ctx, _) = collective_setup(scheme(&config), &config, 2).unwrap();
    let mut solo = CellCnn::new(config.clone(), Arc::new(ctx), party_rng(&config, 0)).unwrap();
    solo.init_weights().unwrap();
    let s = sample();
    let batch = Batch::from_samples(&[&s, &s]).unwrap();
    for _ in 0..2 {
        let g = solo.plain_step(&batch, true).unwrap();
        solo.apply_plain_update(g).unwrap();
    }
    let want = solo.plain_state().unwrap();
    assert!(report.c.unwrap().max_abs_diff(&want.c).unwrap() < 1e-12);
    assert!(report.w.unwrap().max_abs_diff(&want.w).unwrap() < 1e-12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_iteration_aborts_non_root() {
    init_logging();
    let (party, mut endpoints, _done, _) = lone_party(1, 2, Duration::from_secs(30));
    let mut root = endpoints.remove(0);
    let task = tokio::spawn(party.run());

    let t = Duration::from_secs(30);
    root.broadcast(&Frame::new(MessageType::Sync, vec![])).unwrap();
    let (from, _) = root.recv_from_child(t).await.unwrap();
    assert_eq!(from, 1);

    // n = 0, then a blob announcing 3 bytes with only 1 present
    root.broadcast(&Frame::new(MessageType::Iteration, vec![0x00, 0x03, 0x01]))
        .unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Cnn(CnnError::Serialization(_))));
    assert_eq!(err.kind(), ErrorKind::Serialization);
    assert_eq!(err.kind().exit_code(), 3);
}

// ─── Timeouts and cancellation ──────────────────────────────────────────────

#[tokio::test]
async fn test_silent_child_times_out() {
    init_logging();
    let (root, _endpoints, _done, _) = lone_party(0, 2, Duration::from_millis(50));
    let err = root.run().await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
    assert_eq!(err.kind(), ErrorKind::ProtocolTimeout);
}

#[tokio::test]
async fn test_cancel_stops_every_party() {
    init_logging();
    let config = tiny_config(3);
    let federation = Federation::start(
        scheme(&config),
        config,
        session(3, 2),
        vec![vec![sample()]; 3],
    )
    .unwrap();
    // the current-thread runtime has not polled any party yet
    federation.cancel();
    let err = federation.wait().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<SessionError>(), Some(SessionError::Cancelled)));
}

// ─── Configuration ──────────────────────────────────────────────────────────

#[test]
fn test_odd_features_rejected_before_setup() {
    // no runtime: anything past validation would panic on spawn
    let config = CnnConfig {
        features: 5,
        ..tiny_config(2)
    };
    let result = Federation::start(scheme(&tiny_config(2)), config, session(2, 2), vec![vec![sample()]; 2]);
    assert!(matches!(
        result,
        Err(CnnError::Config(ConfigError::NotEven { field: "features", value: 5 }))
    ));

    let result = Federation::start(
        scheme(&tiny_config(2)),
        tiny_config(3),
        session(2, 2),
        vec![vec![sample()]; 2],
    );
    assert!(matches!(result, Err(CnnError::Config(ConfigError::OutOfRange { field: "n_parties", .. }))));
}

//! Full path: gRPC submission call -> dispatcher -> pool -> libp2p stream -> sequencer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use snapshot_relay::config::{BridgeConfig, PoolConfig};
use snapshot_relay::messages::{Request, SnapshotSubmission, SubmissionClient};
use snapshot_relay::{Dispatcher, LogReporter, RpcServer, StreamPool, SubmissionBridge};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{init_tracing, manager_for, Sequencer, TEST_TIMEOUT};

fn submission(slot_id: u64, cid: &str) -> SnapshotSubmission {
    SnapshotSubmission {
        request: Some(Request {
            slot_id,
            snapshot_cid: cid.into(),
            epoch_id: 12,
            project_id: "pairContract_trade_volume:0xabc".into(),
            ..Default::default()
        }),
        signature: "0xsig".into(),
        data_market: "0xtest".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn streamed_submissions_reach_the_sequencer() {
    init_tracing();
    let mut sequencer = Sequencer::spawn().await;
    let manager = manager_for(&sequencer);
    manager.establish_connection().await.expect("establish");

    let pool = Arc::new(
        StreamPool::new(Arc::clone(&manager), PoolConfig { max_size: 2, ..PoolConfig::default() }).expect("pool"),
    );
    let bridge = SubmissionBridge::new(
        Arc::clone(&pool),
        Arc::clone(&manager),
        Arc::new(LogReporter),
        BridgeConfig { worker_pool_size: 2, ..BridgeConfig::default() },
    )
    .expect("bridge");
    let dispatcher = Arc::new(Dispatcher::spawn(Arc::new(bridge)));
    let server = RpcServer::bind("127.0.0.1:0".parse().expect("addr"), dispatcher)
        .await
        .expect("bind");
    let rpc_addr = server.local_addr().expect("local addr");
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(cancel.clone()));

    let mut client = SubmissionClient::connect(format!("http://{rpc_addr}"))
        .await
        .expect("connect");

    let submissions = vec![submission(1, "bafy-one"), submission(2, "bafy-two")];
    let mut responses = timeout(TEST_TIMEOUT, client.stream_snapshots(tokio_stream::iter(submissions.clone())))
        .await
        .expect("call timed out")
        .expect("stream call")
        .into_inner();
    let mut answers = Vec::new();
    while let Some(reply) = timeout(TEST_TIMEOUT, responses.message())
        .await
        .expect("reply timed out")
        .expect("read reply")
    {
        answers.push(reply.message);
    }
    assert_eq!(answers, vec!["Success", "Success"]);

    // Unary calls take the same path.
    let unary = client
        .submit_snapshot(submission(3, "bafy-three"))
        .await
        .expect("unary call")
        .into_inner();
    assert_eq!(unary.message, "Success");

    for sent in submissions.iter().chain([&submission(3, "bafy-three")]) {
        let payload = sent.to_payload().expect("payload");
        assert!(sequencer.wait_for(&payload).await, "sequencer missing slot payload");
    }
    // Streams come back to the pool after delivery.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pool.idle_count() >= 1);

    cancel.cancel();
    pool.stop();
    manager.shutdown().await;
}

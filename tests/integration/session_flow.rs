//! Call ordering, connection loss, and timeouts

use std::sync::Arc;
use std::time::Duration;

use capwire::session::{CallGraph, CallId, CallResult, Outcome, WireMessage};
use capwire::{
    CapabilityId, MemoryTransport, Operation, OperationRecord, PlaceholderId, RemoteErrorKind,
    RpcError, SessionConfig, TargetObject, TransportSession, Value,
};

use super::common::{client_with_raw_peer, connected, server_with_raw_peer, Counter};

fn expect_graph(message: WireMessage) -> CallGraph {
    match message {
        WireMessage::CallGraph(graph) => graph,
        other => panic!("expected a call graph, got {other:?}"),
    }
}

fn expect_result(message: WireMessage) -> CallResult {
    match message {
        WireMessage::Result(result) => result,
        other => panic!("expected a result, got {other:?}"),
    }
}

fn depth_graph(call_id: u64, subject: PlaceholderId) -> WireMessage {
    WireMessage::CallGraph(CallGraph {
        call_id: CallId(call_id),
        root_capability_id: CapabilityId::BOOTSTRAP,
        operations: OperationRecord::new(subject, vec![Operation::Get("depth".to_string())]),
        imported_references: vec![],
    })
}

#[tokio::test]
async fn results_are_routed_by_call_id() {
    let (client, mut peer) = client_with_raw_peer(SessionConfig::default());
    let counter = client.bootstrap();
    let shallow = counter.get("depth");
    let deep = counter.call("next", vec![]).get("depth");

    let driver = async {
        let first = expect_graph(peer.recv().await);
        let second = expect_graph(peer.recv().await);
        assert!(first.call_id < second.call_id);
        for graph in [second, first] {
            let depth = graph.operations.operations.len() as i64;
            peer.send(&WireMessage::Result(CallResult {
                call_id: graph.call_id,
                outcome: Outcome::Value(Value::Int(depth)),
            }))
            .await;
        }
    };
    let (shallow, deep, ()) = tokio::join!(shallow.resolve_value(), deep.resolve_value(), driver);

    assert_eq!(shallow.unwrap(), Value::Int(1));
    assert_eq!(deep.unwrap(), Value::Int(2));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn call_ids_increase_on_the_wire() {
    let pair = connected(Counter::default());
    let counter = pair.client.bootstrap();

    let stubs: Vec<_> = (0..5)
        .map(|n: i64| counter.call("add", vec![Value::Int(n).into()]))
        .collect();
    let results = futures::future::join_all(stubs.iter().map(|stub| stub.resolve_value())).await;
    let results: Vec<Value> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(results, (0..5).map(Value::Int).collect::<Vec<_>>());

    let ids: Vec<u64> = pair
        .tap
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            WireMessage::CallGraph(graph) => Some(graph.call_id.0),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids out of order: {ids:?}");
}

#[tokio::test]
async fn losing_the_peer_rejects_pending_and_later_calls() {
    let (client, mut peer) = client_with_raw_peer(SessionConfig::default());
    let counter = client.bootstrap();
    let depth = counter.get("depth");

    let driver = async move {
        expect_graph(peer.recv().await);
    };
    let (result, ()) = tokio::join!(depth.resolve(), driver);

    assert!(matches!(result, Err(RpcError::ConnectionLost(_))), "{result:?}");
    assert!(client.is_closed());
    assert_eq!(client.pending_calls(), 0);
    assert!(matches!(
        counter.get("depth").resolve().await,
        Err(RpcError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn shutdown_rejects_new_calls() {
    let pair = connected(Counter::default());
    let counter = pair.client.bootstrap();
    assert_eq!(counter.get("depth").resolve_value().await.unwrap(), Value::Int(0));

    pair.client.shutdown();
    assert!(pair.client.is_closed());
    assert_eq!(pair.client.import_count(), 0);
    assert!(matches!(
        counter.call("next", vec![]).resolve().await,
        Err(RpcError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn unanswered_calls_time_out() {
    let config = SessionConfig::default().with_resolve_timeout(Duration::from_millis(50));
    let (client, mut peer) = client_with_raw_peer(config);
    let counter = client.bootstrap();

    let err = counter.get("depth").resolve().await.unwrap_err();
    assert_eq!(err, RpcError::Timeout(50));
    expect_graph(peer.recv().await);
}

#[tokio::test]
async fn both_sides_can_export() {
    let (left, right) = MemoryTransport::pair();
    let exported: Arc<dyn TargetObject> = Arc::new(Counter { depth: 10 });
    let alpha = TransportSession::new(left, Some(exported), SessionConfig::default());
    let beta = TransportSession::serve(right, Counter { depth: 20 }, SessionConfig::default());

    let from_alpha = alpha.bootstrap().call("add", vec![1.into()]);
    let from_beta = beta.bootstrap().call("add", vec![2.into()]);
    let (a, b) = tokio::join!(from_alpha.resolve_value(), from_beta.resolve_value());

    assert_eq!(a.unwrap(), Value::Int(21));
    assert_eq!(b.unwrap(), Value::Int(12));
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (server, mut peer) = server_with_raw_peer(Counter { depth: 3 });

    peer.send_raw("this is not json").await;
    peer.send_raw(r#"{"type":"teleport"}"#).await;
    peer.send(&depth_graph(7, PlaceholderId::ROOT)).await;

    let result = expect_result(peer.recv().await);
    assert_eq!(result.call_id, CallId(7));
    assert_eq!(result.outcome, Outcome::Value(Value::Int(3)));
    assert!(!server.is_closed());
}

#[tokio::test]
async fn unbound_placeholders_are_protocol_violations() {
    let (_server, mut peer) = server_with_raw_peer(Counter::default());

    peer.send(&depth_graph(1, PlaceholderId(4))).await;

    match expect_result(peer.recv().await).outcome {
        Outcome::Error(err) => assert_eq!(err.kind, RemoteErrorKind::ProtocolViolation),
        other => panic!("unexpected {other:?}"),
    }
}

//! Promise pipelining: queued chains travel as single call graphs

use capwire::session::WireMessage;
use capwire::{capture, CaptureError, Param, Value};
use proptest::prelude::*;

use super::common::{connected, Counter, Tally};

#[tokio::test]
async fn chained_calls_send_one_graph() {
    let pair = connected(Counter::default());
    let counter = pair.client.bootstrap();

    let depth = counter
        .call("next", vec![])
        .call("next", vec![])
        .call("next", vec![])
        .get("depth");
    assert_eq!(depth.queued(), 4);
    assert_eq!(pair.tap.count("call_graph"), 0);

    assert_eq!(depth.resolve_value().await.unwrap(), Value::Int(3));
    assert_eq!(pair.tap.count("call_graph"), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_chain_length_is_one_round_trip(k in 1usize..12) {
        let (value, graphs) = tokio_test::block_on(async {
            let pair = connected(Counter::default());
            let mut stub = pair.client.bootstrap().stub();
            for _ in 0..k {
                stub = stub.call("next", vec![]);
            }
            let value = stub.get("depth").resolve_value().await.unwrap();
            (value, pair.tap.count("call_graph"))
        });
        prop_assert_eq!(value, Value::Int(k as i64));
        prop_assert_eq!(graphs, 1);
    }
}

#[tokio::test]
async fn forked_chains_share_their_prefix() {
    let pair = connected(Counter::default());
    let two = pair.client.bootstrap().call("next", vec![]).call("next", vec![]);

    let three = two.call("next", vec![]).get("depth");
    let info = two.call("info", vec![]);

    assert_eq!(three.resolve_value().await.unwrap(), Value::Int(3));
    assert_eq!(
        info.resolve_value().await.unwrap().field("depth"),
        Some(&Value::Int(2))
    );
    assert_eq!(pair.tap.count("call_graph"), 2);
}

#[tokio::test]
async fn step_used_as_target_and_argument_runs_once() {
    let tally = Tally::default();
    let pair = connected(tally.clone());
    let root = pair.client.bootstrap();

    let me = root.call("me", vec![]);
    let paired = me.call("pair", vec![Param::from(&me)]);
    assert_eq!(paired.resolve_value().await.unwrap(), Value::Int(1));
    assert_eq!(tally.touches(), 1);
    assert_eq!(pair.tap.count("call_graph"), 1);

    let frames = pair.tap.messages();
    let WireMessage::CallGraph(graph) = &frames[0] else {
        panic!("expected a call graph, got {:?}", frames[0]);
    };
    assert_eq!(graph.imported_references.len(), 1);
    assert_eq!(graph.operations.subject, graph.imported_references[0].placeholder_id);
}

#[tokio::test]
async fn nested_shared_steps_each_run_once() {
    let tally = Tally::default();
    let pair = connected(tally.clone());
    let root = pair.client.bootstrap();

    let outer = root.call("me", vec![]);
    let inner = outer.call("me", vec![]);
    let paired = inner.call("pair", vec![Param::from(&outer), Param::from(&inner)]);
    assert_eq!(paired.resolve_value().await.unwrap(), Value::Int(2));
    assert_eq!(tally.touches(), 2);

    // Each resolve is its own graph, so the prefix runs again here.
    assert_eq!(inner.get("touches").resolve_value().await.unwrap(), Value::Int(4));
    assert_eq!(pair.tap.count("call_graph"), 2);
}

#[tokio::test]
async fn capture_entries_sharing_a_step_run_it_once() {
    let tally = Tally::default();
    let pair = connected(tally.clone());
    let me = pair.client.bootstrap().call("me", vec![]);

    let paired = capture(
        vec![Param::from(&me), Param::from(me.call("me", vec![]))],
        |c| -> Result<_, CaptureError> { Ok(c.expr(0)?.call("pair", vec![c.operand(1)?])) },
    )
    .await
    .unwrap();
    assert_eq!(paired.resolve_value().await.unwrap(), Value::Int(1));
    assert_eq!(tally.touches(), 2);
    assert_eq!(pair.tap.count("call_graph"), 1);
}

#[tokio::test]
async fn stub_arguments_on_live_capabilities_are_embedded() {
    let pair = connected(Counter::default());
    let counter = pair.client.bootstrap();
    let other = pair.client.bootstrap();

    let offset = other.call("next", vec![]).call("next", vec![]).get("depth");
    let sum = counter
        .call("next", vec![])
        .call("add", vec![Param::from(offset)]);

    assert_eq!(sum.resolve_value().await.unwrap(), Value::Int(3));

    let graphs: Vec<_> = pair
        .tap
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            WireMessage::CallGraph(graph) => Some(graph),
            _ => None,
        })
        .collect();
    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs[0].imported_references.len(), 1);
    assert_eq!(graphs[0].imported_references[0].path.len(), 3);
}

#[tokio::test]
async fn chaining_on_an_in_flight_capability_waits_for_it() {
    let pair = connected(Counter::default());
    let counter = pair.client.bootstrap();

    let pending = capture(vec![Param::from(&counter)], |c| {
        Ok::<_, CaptureError>(c.expr(0)?.call("next", vec![]))
    })
    .await
    .unwrap();
    assert!(pending.is_in_flight());

    let depth = pending.call("next", vec![]).get("depth");
    assert_eq!(depth.resolve_value().await.unwrap(), Value::Int(2));
    assert_eq!(pair.tap.count("call_graph"), 2);
}

#[tokio::test]
async fn operations_on_an_in_flight_value_apply_locally() {
    let pair = connected(Counter::default());
    let counter = pair.client.bootstrap();

    let info = capture(vec![Param::from(&counter)], |c| {
        Ok::<_, CaptureError>(c.expr(0)?.call("info", vec![]))
    })
    .await
    .unwrap();

    let kind = info.get("kind");
    assert_eq!(kind.resolve_value().await.unwrap(), Value::from("counter"));
    let deep = info.get("depth").call(">=", vec![Param::from(0)]);
    assert_eq!(deep.resolve_value().await.unwrap(), Value::Bool(true));
    assert_eq!(pair.tap.count("call_graph"), 1);
}

#[tokio::test]
async fn resolving_a_bare_capability_sends_nothing() {
    let pair = connected(Counter::default());
    let counter = pair.client.bootstrap();

    let same = counter.stub().resolve_capability().await.unwrap();
    assert_eq!(same.id(), counter.id());
    assert!(pair.tap.frames().is_empty());
}

#[tokio::test]
async fn remote_objects_come_back_as_capabilities() {
    let pair = connected(Counter::default());
    let child = pair
        .client
        .bootstrap()
        .call("next", vec![])
        .resolve_capability()
        .await
        .unwrap();

    assert_eq!(child.type_tag(), "Counter");
    assert_ne!(child.id(), pair.client.bootstrap().id());
    assert_eq!(child.get("depth").resolve_value().await.unwrap(), Value::Int(1));
}

#[tokio::test]
async fn unknown_method_rejects_with_no_such_method() {
    let pair = connected(Counter::default());
    let err = pair
        .client
        .bootstrap()
        .call("frobnicate", vec![])
        .resolve()
        .await
        .unwrap_err();
    assert!(err.is_no_such_method(), "unexpected {err:?}");
}

#[tokio::test]
async fn resolve_as_deserializes_values() {
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Info {
        depth: i64,
        kind: String,
    }

    let pair = connected(Counter::default());
    let info: Info = pair
        .client
        .bootstrap()
        .call("next", vec![])
        .call("info", vec![])
        .resolve_as()
        .await
        .unwrap();
    assert_eq!(
        info,
        Info {
            depth: 1,
            kind: "counter".to_string()
        }
    );
}

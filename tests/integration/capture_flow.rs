//! Callback capture against the row-set query service

use capwire::session::WireMessage;
use capwire::{
    capture, CaptureError, Captured, Expr, Operand, Param, QueryService, RpcError, Value,
};

use super::common::{connected, Counter};

fn names(rows: &Value) -> Vec<(String, i64)> {
    rows.as_list()
        .expect("a list of rows")
        .iter()
        .map(|row| {
            (
                row.field("name").and_then(Value::as_str).unwrap().to_string(),
                row.field("age").and_then(Value::as_i64).unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn where_and_order_by_replay_remotely_in_one_graph() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let query = capture(vec![Param::from(service.call("values", vec![]))], |c| {
        let rows = c.expr(0)?;
        Ok::<_, CaptureError>(
            rows.call_with("where", |row| {
                row.get("age").call(">=", vec![30.into()]).call(
                    "and",
                    vec![row.get("age").call("<", vec![32.into()]).into()],
                )
            })
            .call("orderBy", vec!["age".into()])
            .call("rows", vec![]),
        )
    })
    .await
    .unwrap();

    let rows = query.resolve_value().await.unwrap();
    assert_eq!(
        names(&rows),
        vec![("Alice".to_string(), 30), ("Bob".to_string(), 31)]
    );
    assert_eq!(pair.tap.count("call_graph"), 1);
}

#[tokio::test]
async fn order_by_callback_sorts_by_name() {
    let people = vec![
        Value::map([("name", Value::from("Bob")), ("age", Value::Int(31))]),
        Value::map([("name", Value::from("Alice")), ("age", Value::Int(30))]),
    ];
    let pair = connected(QueryService::new(people));
    let rows = pair.client.bootstrap().call("values", vec![]);

    let sorted = capture(vec![Param::from(rows)], |c| -> Result<Expr, CaptureError> {
        Ok(c.expr(0)?
            .call_with("where", |r| r.get("age").call(">=", vec![30.into()]))
            .call_with("orderBy", |r| r.get("name"))
            .call("rows", vec![]))
    })
    .await
    .unwrap();

    assert_eq!(
        names(&sorted.resolve_value().await.unwrap()),
        vec![("Alice".to_string(), 30), ("Bob".to_string(), 31)]
    );
}

#[tokio::test]
async fn plain_values_pass_through_to_nested_callbacks() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let query = capture(
        vec![Param::from(&service), Param::from(32)],
        |c| -> Result<_, CaptureError> {
            let min: Operand<'static> = c.operand(1)?;
            Ok(c.expr(0)?
                .call("values", vec![])
                .call_with("where", move |row| row.get("age").call(">=", vec![min]))
                .call("rows", vec![]))
        },
    )
    .await
    .unwrap();

    let rows = query.resolve_value().await.unwrap();
    assert_eq!(names(&rows), vec![("Charlie".to_string(), 32)]);
}

#[tokio::test]
async fn captured_result_keeps_pipelining() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let rows = capture(vec![Param::from(&service)], |c| {
        Ok::<_, CaptureError>(c.expr(0)?.call("values", vec![]))
    })
    .await
    .unwrap();

    let count = rows.call("limit", vec![Param::from(2)]).get("length");
    assert_eq!(count.resolve_value().await.unwrap(), Value::Int(2));
}

#[tokio::test]
async fn literal_results_ignore_the_target() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let answer = capture(vec![Param::from(&service)], |_c| 42)
        .await
        .unwrap();
    assert_eq!(answer.resolve_value().await.unwrap(), Value::Int(42));
}

#[tokio::test]
async fn test_method_returns_plain_object() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let out = capture(vec![Param::from(&service)], |c| {
        Ok::<_, CaptureError>(c.expr(0)?.call("test", vec![]))
    })
    .await
    .unwrap();
    assert_eq!(
        out.resolve_value().await.unwrap(),
        Value::map([("foo", "bar")])
    );
}

#[tokio::test]
async fn shape_errors_surface_before_sending() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let err = capture(vec![Param::from(&service)], |c| -> Result<Expr, CaptureError> {
        let rows = c.expr(0)?;
        if rows.get("length").to_i64()? > 3 {
            return Ok(rows.call("limit", vec![3.into()]));
        }
        Ok(rows)
    })
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Capture(CaptureError::UnsupportedCallbackShape(_))
    ));

    let err = capture(vec![Param::from(&service)], |c| {
        let rows = c.expr(0)?;
        rows.call("values", vec![]);
        Ok::<_, CaptureError>(rows.call("test", vec![]))
    })
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Capture(CaptureError::UnsupportedCallbackShape(_))
    ));

    assert!(pair.tap.frames().is_empty());
}

#[tokio::test]
async fn select_callback_builds_objects_from_rows() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();
    let expected = Value::List(vec![Value::map([
        ("userId", Value::Int(1)),
        ("userName", Value::from("Alice")),
    ])]);

    let captured = capture(vec![Param::from(&service)], |c| -> Result<_, CaptureError> {
        Ok(c.expr(0)?
            .call("getQuery", vec![])
            .call_with("select", |row| {
                Captured::map([
                    ("userId", row.get("id").into()),
                    ("userName", row.get("name").into()),
                ])
            })
            .call("execute", vec![]))
    })
    .await
    .unwrap();
    assert_eq!(captured.resolve_value().await.unwrap(), expected);

    let queued = service
        .call("getQuery", vec![])
        .call_with("select", |row| {
            Captured::map([
                ("userId", row.get("id").into()),
                ("userName", row.get("name").into()),
            ])
        })
        .unwrap()
        .call("execute", vec![]);
    assert_eq!(queued.resolve_value().await.unwrap(), expected);
    assert_eq!(pair.tap.count("call_graph"), 2);
}

#[tokio::test]
async fn reusing_a_recorded_step_is_refused_before_sending() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let err = capture(vec![Param::from(&service)], |c| -> Result<_, CaptureError> {
        let rows = c.expr(0)?.call("values", vec![]);
        Ok(rows.call("union", vec![(&rows).into()]))
    })
    .await
    .unwrap_err();
    match err {
        RpcError::Capture(CaptureError::UnsupportedCallbackShape(reason)) => {
            assert!(reason.contains("used more than once"), "{reason}")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(pair.tap.frames().is_empty());
}

#[tokio::test]
async fn in_flight_entries_settle_before_recording_errors() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();
    let rows = capture(vec![Param::from(&service)], |c| {
        Ok::<_, CaptureError>(c.expr(0)?.call("values", vec![]))
    })
    .await
    .unwrap();
    assert!(rows.is_in_flight());

    let err = capture(vec![Param::from(&rows)], |c| -> Result<Expr, CaptureError> {
        c.expr(0)?.get("length").to_i64()?;
        c.expr(0)
    })
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Capture(CaptureError::UnsupportedCallbackShape(_))
    ));
    // Only the entry's own graph went out.
    assert_eq!(pair.tap.count("call_graph"), 1);
}

#[tokio::test]
async fn capture_needs_capabilities_from_one_session() {
    let first = connected(QueryService::default());
    let second = connected(Counter::default());

    let err = capture(vec![Param::from(1), Param::from("x")], |_c| 0)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Capture(CaptureError::NoCapabilities));

    let err = capture(
        vec![
            Param::from(first.client.bootstrap()),
            Param::from(second.client.bootstrap()),
        ],
        |_c| 0,
    )
    .await
    .unwrap_err();
    assert_eq!(err, RpcError::Capture(CaptureError::MixedSessions));
    assert_eq!(first.tap.count("call_graph"), 0);
    assert_eq!(second.tap.count("call_graph"), 0);
}

#[tokio::test]
async fn remote_failures_reject_only_their_call() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();

    let broken = capture(vec![Param::from(&service)], |c| {
        Ok::<_, CaptureError>(c.expr(0)?.call("frobnicate", vec![]))
    })
    .await
    .unwrap();
    let fine = service.call("test", vec![]);

    let err = broken.resolve().await.unwrap_err();
    assert!(err.is_no_such_method(), "unexpected {err:?}");
    assert!(fine.resolve_value().await.is_ok());
}

#[tokio::test]
async fn bindings_name_every_captured_capability() {
    let pair = connected(QueryService::default());
    let service = pair.client.bootstrap();
    let people = service.call("values", vec![]);

    let combined = capture(
        vec![Param::from(&service), Param::from(&people)],
        |c| -> Result<_, CaptureError> {
            let _service = c.expr(0)?;
            Ok(c.expr(1)?.call("count", vec![]))
        },
    )
    .await
    .unwrap();
    assert_eq!(combined.resolve_value().await.unwrap(), Value::Int(3));

    let graph = pair
        .tap
        .messages()
        .into_iter()
        .find_map(|m| match m {
            WireMessage::CallGraph(graph) => Some(graph),
            _ => None,
        })
        .unwrap();
    assert_eq!(graph.root_capability_id, service.id());
    let placeholders: Vec<u32> = graph
        .imported_references
        .iter()
        .map(|b| b.placeholder_id.0)
        .collect();
    assert_eq!(placeholders, vec![1, 2]);
    assert!(graph.imported_references[0].path.is_empty());
    assert_eq!(graph.imported_references[1].path.len(), 1);
}

#[tokio::test]
async fn demo_returns_ordered_rows() {
    let rows = capwire::demo::run_demo(31, capwire::SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(
        names(&Value::List(rows)),
        vec![("Bob".to_string(), 31), ("Charlie".to_string(), 32)]
    );
}

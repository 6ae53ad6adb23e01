//! End-to-end demo: a query service served over a line-framed pipe.

use crate::capture::capture;
use crate::config::SessionConfig;
use crate::error::{CaptureError, RpcError};
use crate::pipeline::Param;
use crate::record::Expr;
use crate::rowset::QueryService;
use crate::session::{LineTransport, TransportSession};
use crate::value::Value;

const PIPE_BYTES: usize = 64 * 1024;

/// Serve a [`QueryService`] on one end of an in-process pipe and, from the
/// other end, fetch everyone at least `min_age` years old ordered by age.
///
/// The filter is a captured callback; the whole query travels as a single
/// call graph.
pub async fn run_demo(min_age: i64, config: SessionConfig) -> Result<Vec<Value>, RpcError> {
    let (client_io, server_io) = tokio::io::duplex(PIPE_BYTES);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let server = TransportSession::serve(
        LineTransport::new(server_read, server_write, config.max_frame_bytes),
        QueryService::default(),
        config.clone(),
    );
    let client = TransportSession::connect(
        LineTransport::new(client_read, client_write, config.max_frame_bytes),
        config,
    );

    let service = client.bootstrap();
    let everyone = service.call("values", vec![]);
    let captures = vec![Param::from(everyone), Param::from(min_age)];
    let adults = capture(captures, |c| -> Result<Expr, CaptureError> {
        let rows = c.expr(0)?;
        let min = c.operand(1)?;
        Ok(rows
            .call_with("where", move |row| row.get("age").call(">=", vec![min]))
            .call("orderBy", vec!["age".into()])
            .call("rows", vec![]))
    })
    .await?;

    let rows = adults.resolve_value().await;
    service.dispose();
    client.shutdown();
    server.shutdown();

    match rows? {
        Value::List(rows) => Ok(rows),
        other => Err(RpcError::Decode(format!(
            "expected a list of rows, got {}",
            other.kind()
        ))),
    }
}

// Integration tests have relaxed clippy settings.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Connection lifecycle: one connect attempt per operator, result replayed.

use std::sync::Arc;

use consul_op_core::{Error, MemoryBackend, MemoryConnector, Operator, OperatorConfig, Result};
use tokio::{sync::Barrier, task::JoinSet};

fn operator_with(connector: &Arc<MemoryConnector>) -> Operator {
    Operator::with_connector(
        OperatorConfig::new("localhost:8500"),
        Arc::clone(connector) as Arc<dyn consul_op_core::Connector>,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connect_runs_once() -> Result<()> {
    let connector = Arc::new(MemoryConnector::new(MemoryBackend::new()));
    let operator = Arc::new(operator_with(&connector));
    let task_count = 16;
    let barrier = Arc::new(Barrier::new(task_count));

    let mut tasks = JoinSet::new();
    for _ in 0..task_count {
        let operator = Arc::clone(&operator);
        let barrier = Arc::clone(&barrier);
        tasks.spawn(async move {
            barrier.wait().await;
            operator.connect().await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| Error::backend("join", e))??;
    }

    assert_eq!(connector.attempts(), 1);
    assert!(operator.is_connected());
    Ok(())
}

#[tokio::test]
async fn failed_connect_is_replayed_not_retried() {
    let connector = Arc::new(MemoryConnector::failing("agent unreachable"));
    let operator = operator_with(&connector);

    let first = operator.connect().await;
    let second = operator.connect().await;

    assert_eq!(
        first,
        Err(Error::ConnectionFailed("agent unreachable".into()))
    );
    assert_eq!(first, second);
    assert_eq!(connector.attempts(), 1);
    assert!(!operator.is_connected());

    assert!(matches!(
        operator.put("k", b"v").await,
        Err(Error::ConnectionFailed(_))
    ));
    assert!(matches!(
        operator.list_service("svc").await,
        Err(Error::ConnectionFailed(_))
    ));
}

#[tokio::test]
async fn operations_before_connect_fail_closed() {
    let connector = Arc::new(MemoryConnector::new(MemoryBackend::new()));
    let operator = operator_with(&connector);
    let cancel = tokio_util::sync::CancellationToken::new();

    assert_eq!(operator.get("k").await, Err(Error::NotConnected));
    assert_eq!(operator.delete("k").await, Err(Error::NotConnected));
    assert_eq!(
        operator.acquire("lock", &cancel).await,
        Err(Error::NotConnected)
    );
    assert_eq!(operator.register_service().await, Err(Error::NotConnected));
    assert_eq!(operator.deregister_service().await, Err(Error::NotConnected));
    assert_eq!(connector.attempts(), 0);
}

#[test]
fn connect_from_blocking_context() -> Result<()> {
    let connector = Arc::new(MemoryConnector::new(MemoryBackend::new()));
    let operator = operator_with(&connector);

    tokio_test::block_on(operator.connect())?;
    tokio_test::block_on(operator.put("app/config", b"v1"))?;
    assert_eq!(tokio_test::block_on(operator.get("app/config"))?, b"v1");
    Ok(())
}

#[tokio::test]
async fn unreachable_http_agent_is_connection_failed() {
    // Port 1 is never a Consul agent; the probe fails fast.
    let operator = Operator::new("127.0.0.1:1");
    let result = operator.connect().await;
    assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    assert!(matches!(
        operator.get("k").await,
        Err(Error::ConnectionFailed(_))
    ));
}

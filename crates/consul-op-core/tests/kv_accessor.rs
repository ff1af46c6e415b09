// Integration tests have relaxed clippy settings.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Key-value accessor against the in-memory backend.

use std::sync::Arc;

use consul_op_core::{Error, MemoryBackend, MemoryConnector, Operator, OperatorConfig, Result};
use proptest::prelude::*;

async fn connected() -> Result<Operator> {
    let operator = Operator::with_connector(
        OperatorConfig::new("localhost:8500"),
        Arc::new(MemoryConnector::new(MemoryBackend::new())),
    );
    operator.connect().await?;
    Ok(operator)
}

#[tokio::test]
async fn never_written_key_is_not_found() -> Result<()> {
    let operator = connected().await?;

    let result = operator.get("never/written").await;
    assert_eq!(result, Err(Error::NotFound("never/written".into())));
    assert!(result.is_err_and(|e| e.is_not_found()));
    assert_eq!(operator.lookup("never/written").await?, None);
    Ok(())
}

#[tokio::test]
async fn empty_value_is_not_missing() -> Result<()> {
    let operator = connected().await?;
    operator.put("empty", b"").await?;
    assert_eq!(operator.get("empty").await?, Vec::<u8>::new());
    Ok(())
}

#[tokio::test]
async fn put_get_delete() -> Result<()> {
    let operator = connected().await?;

    operator.put("app/config", b"v1").await?;
    assert_eq!(operator.get("app/config").await?, b"v1");

    operator.put("app/config", b"v2").await?;
    assert_eq!(operator.get("app/config").await?, b"v2");

    operator.delete("app/config").await?;
    assert!(matches!(
        operator.get("app/config").await,
        Err(Error::NotFound(key)) if key == "app/config"
    ));

    // Deleting again is fine.
    operator.delete("app/config").await?;
    Ok(())
}

#[tokio::test]
async fn version_increases_on_every_write() -> Result<()> {
    let operator = connected().await?;

    operator.put("counter", b"1").await?;
    let (_, first) = operator.get_with_version("counter").await?;
    operator.put("other", b"x").await?;
    operator.put("counter", b"2").await?;
    let (value, second) = operator.get_with_version("counter").await?;

    assert_eq!(value, b"2");
    assert!(second > first);
    Ok(())
}

proptest! {
    #[test]
    fn prop_bytes_round_trip(value in proptest::collection::vec(any::<u8>(), 0..256)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let stored = runtime.block_on(async {
            let operator = connected().await?;
            operator.put("blob", &value).await?;
            operator.get("blob").await
        });
        prop_assert_eq!(stored.ok(), Some(value));
    }
}

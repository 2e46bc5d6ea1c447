//! Processor host and remote subscription E2E tests.

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Arc, Mutex,
      atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
  };

  use async_trait::async_trait;
  use dashmap::DashSet;

  use crate::{
    rowlog::{MessageId, RowLogMessage, Subscription},
    worker::{
      ListenerTransport, MessageConsumer, ProcessResult, ProcessorHost, TransportError,
      __tests__::helpers::{INDEXER, PipelineTestContext, WAIT, wait_until},
    },
  };

  #[derive(Default)]
  struct FakeTransport {
    down: DashSet<String>,
    delivered: Mutex<Vec<(String, Option<Vec<u8>>)>>,
  }

  #[async_trait]
  impl ListenerTransport for FakeTransport {
    async fn deliver(&self, listener: &str, _id: &MessageId, payload: Option<Vec<u8>>) -> Result<bool, TransportError> {
      if self.down.contains(listener) {
        return Err(TransportError::Unreachable(listener.to_string()));
      }
      self.delivered.lock().unwrap().push((listener.to_string(), payload));
      Ok(true)
    }
  }

  #[derive(Default)]
  struct Counting {
    seen: AtomicUsize,
  }

  #[async_trait]
  impl MessageConsumer for Counting {
    async fn process(&self, _message: Arc<RowLogMessage>) -> ProcessResult {
      self.seen.fetch_add(1, Ordering::SeqCst);
      ProcessResult::Done
    }
  }

  fn remote(id: &str) -> Subscription {
    Subscription::remote(id).with_wakeup_timeout(Duration::from_millis(50))
  }

  /// Test: the host starts and stops processors as subscriptions are added
  /// and removed.
  #[tokio::test]
  async fn test_host_follows_registry() {
    let ctx = PipelineTestContext::new().await;
    let audit = Arc::new(Counting::default());
    let host = ProcessorHost::new(ctx.rowlog.clone(), ctx.settings.clone())
      .with_consumer(INDEXER, ctx.updater.clone())
      .with_consumer("audit", audit.clone())
      .spawn();

    assert!(wait_until(WAIT, || host.running() == vec![INDEXER]).await);

    ctx
      .registry
      .add(&Subscription::local("audit").with_wakeup_timeout(Duration::from_millis(50)))
      .await
      .unwrap();
    assert!(wait_until(WAIT, || host.running() == vec!["audit", INDEXER]).await);

    ctx.put_book("b1", "Dune").await;
    assert!(wait_until(WAIT, || audit.seen.load(Ordering::SeqCst) == 1).await);
    assert!(wait_until(WAIT, || ctx.shard.contains("b1-last")).await);
    assert!(ctx.wait_for_empty_log().await);

    ctx.registry.remove("audit").await.unwrap();
    assert!(wait_until(WAIT, || host.running() == vec![INDEXER]).await);

    host.shutdown().await.unwrap();
  }

  /// Test: messages of a remote subscription reach a listener, failing over
  /// past an unreachable one; other subscriptions still owe them.
  #[tokio::test]
  async fn test_remote_subscription_delivers_to_listeners() {
    let ctx = PipelineTestContext::new().await;
    ctx.registry.add(&remote("search-sync")).await.unwrap();
    ctx.registry.add_listener("search-sync", "l1").await.unwrap();
    ctx.registry.add_listener("search-sync", "l2").await.unwrap();

    let transport = Arc::new(FakeTransport::default());
    transport.down.insert("l1".to_string());
    let host = ProcessorHost::new(ctx.rowlog.clone(), ctx.settings.clone())
      .with_transport(transport.clone())
      .spawn();

    ctx.rowlog.append(b"row1", Some(b"first".to_vec())).await.unwrap();
    ctx.rowlog.append(b"row2", Some(b"second".to_vec())).await.unwrap();

    assert!(wait_until(WAIT, || transport.delivered.lock().unwrap().len() == 2).await);
    let delivered = transport.delivered.lock().unwrap().clone();
    assert!(delivered.iter().all(|(listener, _)| listener == "l2"));
    let mut payloads: Vec<_> = delivered.into_iter().filter_map(|(_, payload)| payload).collect();
    payloads.sort();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);

    // Done for the remote subscription, still pending for the local one
    assert!(wait_until(WAIT, || host.running() == vec!["search-sync"]).await);
    let mut remaining = Vec::new();
    for _ in 0..100 {
      remaining = ctx.rowlog.next("search-sync", 10).await.unwrap();
      if remaining.is_empty() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(remaining.is_empty());
    assert_eq!(ctx.rowlog.next(INDEXER, 10).await.unwrap().len(), 2);

    host.shutdown().await.unwrap();
  }

  /// Test: without listeners a remote message stays pending until one registers.
  #[tokio::test]
  async fn test_remote_message_waits_for_listener() {
    let ctx = PipelineTestContext::new().await;
    ctx.registry.add(&remote("search-sync")).await.unwrap();

    let transport = Arc::new(FakeTransport::default());
    let host = ProcessorHost::new(ctx.rowlog.clone(), ctx.settings.clone())
      .with_transport(transport.clone())
      .spawn();

    let message = ctx.rowlog.append(b"row1", None).await.unwrap();
    let mut tries = 0;
    for _ in 0..500 {
      let state = ctx.rowlog.state(message.id()).await.unwrap().unwrap();
      tries = state["search-sync"].try_count;
      if tries >= 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(tries >= 1);
    assert!(transport.delivered.lock().unwrap().is_empty());

    ctx.registry.add_listener("search-sync", "l1").await.unwrap();
    assert!(wait_until(WAIT, || transport.delivered.lock().unwrap().len() == 1).await);

    host.shutdown().await.unwrap();
  }
}

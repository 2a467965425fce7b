//! Routing agent streams to clients

use std::collections::BTreeMap;

use assert_matches::assert_matches;
use tailwatch::{Error, actors::supervisor::AgentPhase, transport::channel_stream};

use crate::helpers::*;

#[tokio::test]
async fn test_rebinding_leaves_one_writer() {
    let manager = spawn_manager(&web1_config(), None).await;
    let client = manager.client("web1").await.unwrap();

    let (first, stream) = channel_stream("agent-1");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();
    let (second, stream) = channel_stream("agent-2");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    eventually(|| async { first.is_closed() }).await;
    assert!(!second.is_closed());
    assert!(!first.send_lines(["ERROR from the old agent"]));

    assert!(second.send_lines(["ERROR from the new agent"]));
    eventually(|| async {
        manager
            .query_records("web1", "err", "unknown")
            .await
            .map(|rows| rows.len() == 2)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(
        client.agent_phases().await.unwrap(),
        BTreeMap::from([("app".to_string(), AgentPhase::Connected)])
    );
}

#[tokio::test]
async fn test_unknown_target_closes_stream() {
    let manager = spawn_manager(&web1_config(), None).await;
    let (sender, stream) = channel_stream("stray");

    assert_matches!(
        manager
            .bind_inbound_stream("web9", "app", Box::new(stream))
            .await,
        Err(Error::TargetNotFound(_))
    );
    assert!(sender.is_closed());
}

#[tokio::test]
async fn test_malformed_frame_ends_connection() {
    let manager = spawn_manager(&web1_config(), None).await;
    let client = manager.client("web1").await.unwrap();
    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    assert!(sender.send_frame(b"{\"not\": \"an array\"}".to_vec()));
    eventually(|| async { sender.is_closed() }).await;
    eventually(|| async {
        client
            .agent_phases()
            .await
            .map(|phases| phases.get("app") != Some(&AgentPhase::Connected))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_closing_manager_closes_streams() {
    let manager = spawn_manager(&web1_config(), None).await;
    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    manager.close();
    eventually(|| async { sender.is_closed() }).await;
}

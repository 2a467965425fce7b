//! Applying new configs to a running manager

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tailwatch::{
    Error, actors::messages::VariableTier, config::ConfigError, transport::channel_stream,
};

use crate::helpers::*;

async fn feed(manager: &tailwatch::actors::manager::ManagerHandle, lines: &[&str]) {
    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();
    sender.send_lines(lines.iter().copied());
    let expected = lines.len() + 1;
    eventually(|| async {
        manager
            .query_records("web1", "err", "unknown")
            .await
            .map(|rows| rows.len() == expected)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_unchanged_sub_filters_survive_reload() {
    let manager = spawn_manager(&web1_config(), None).await;
    feed(&manager, &["ERROR one", "ERROR two"]).await;
    let before = manager.query_records("web1", "err", "unknown").await.unwrap();

    // add a second target and a second sub filter
    let raw = raw_config(
        vec![target("web1", true, &["app"]), target("web2", true, &[])],
        err_filter(&[("noisy", 3), ("unknown", 2)]),
    );
    manager.build(parse(&raw), raw.clone()).await.unwrap();

    let after = manager.query_records("web1", "err", "unknown").await.unwrap();
    assert_eq!(before, after);
    assert_eq!(
        manager
            .query_variables(VariableTier::SubFilter, "web1", "err")
            .await
            .unwrap(),
        vec!["noisy", "unknown"]
    );
    assert_eq!(manager.config_text().await.unwrap(), raw);
}

#[tokio::test]
async fn test_renamed_sub_filter_starts_empty() {
    let manager = spawn_manager(&web1_config(), None).await;
    feed(&manager, &["ERROR one"]).await;

    // same entry points, only the id changes
    let renamed = web1_config().replace("\"unknown\"", "\"noisy\"");
    manager.build(parse(&renamed), renamed).await.unwrap();

    let rows = manager.query_records("web1", "err", "noisy").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].summary.starts_with("total:0 ignore:0 print:0"));
}

#[tokio::test]
async fn test_failed_build_changes_nothing() {
    let raw = web1_config();
    let manager = spawn_manager(&raw, None).await;
    feed(&manager, &["ERROR one"]).await;

    // web2 is new and its build fails, web1 would be reloaded
    let broken = raw_config(
        vec![target("web1", true, &["app"]), target("web2", true, &[])],
        err_filter(&[("unknown", 2), ("missing", 2)]),
    );
    assert_matches!(
        manager.build(parse(&broken), broken).await,
        Err(Error::Pipeline { .. })
    );

    assert_eq!(manager.client_ids().await.unwrap(), vec!["web1"]);
    assert_eq!(manager.config_text().await.unwrap(), raw);
    assert_eq!(
        manager
            .query_variables(VariableTier::SubFilter, "web1", "err")
            .await
            .unwrap(),
        vec!["unknown"]
    );
    assert_eq!(
        manager.query_records("web1", "err", "unknown").await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_removed_target_is_freed() {
    let raw = raw_config(
        vec![target("web1", true, &["app"]), target("web2", true, &["app"])],
        err_filter(&[("unknown", 2)]),
    );
    let manager = spawn_manager(&raw, None).await;
    let web1 = manager.client("web1").await.unwrap();

    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    let without_web1 = raw_config(
        vec![target("web2", true, &["app"])],
        err_filter(&[("unknown", 2)]),
    );
    manager
        .build(parse(&without_web1), without_web1)
        .await
        .unwrap();

    assert!(web1.is_closed());
    eventually(|| async { sender.is_closed() }).await;
    assert_eq!(manager.client_ids().await.unwrap(), vec!["web2"]);
    assert_eq!(
        manager
            .query_variables(VariableTier::Target, "", "")
            .await
            .unwrap(),
        vec!["web2"]
    );
}

#[tokio::test]
async fn test_closed_target_is_hidden_but_queryable() {
    let raw = raw_config(
        vec![target("web1", true, &[]), target("web2", false, &[])],
        err_filter(&[("unknown", 2)]),
    );
    let manager = spawn_manager(&raw, None).await;

    assert_eq!(
        manager
            .query_variables(VariableTier::Target, "", "")
            .await
            .unwrap(),
        vec!["web1"]
    );
    assert_eq!(
        manager
            .query_variables(VariableTier::Filter, "web2", "")
            .await
            .unwrap(),
        vec!["err"]
    );
}

#[tokio::test]
async fn test_reload_persists_staged_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let raw = web1_config();
    std::fs::write(&path, &raw).unwrap();
    let manager = spawn_manager(&raw, Some(path.clone())).await;

    assert_matches!(manager.reload().await, Err(Error::NothingStaged));

    let next = raw_config(
        vec![target("web1", true, &["app"]), target("web3", true, &[])],
        err_filter(&[("unknown", 4)]),
    );
    manager.stage(next.clone()).await.unwrap();
    manager.reload().await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), next);
    assert_eq!(manager.client_ids().await.unwrap(), vec!["web1", "web3"]);
}

#[tokio::test]
async fn test_reload_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let raw = web1_config();
    std::fs::write(&path, &raw).unwrap();
    let manager = spawn_manager(&raw, Some(path.clone())).await;

    let duplicate = raw_config(
        vec![target("web1", true, &[]), target("web1", true, &[])],
        err_filter(&[("unknown", 2)]),
    );
    manager.stage(duplicate).await.unwrap();
    assert_matches!(manager.reload().await, Err(Error::Config(_)));

    manager.stage("{ not json".to_string()).await.unwrap();
    assert_matches!(manager.reload().await, Err(Error::Config(_)));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), raw);
}

#[tokio::test]
async fn test_repeated_filter_ref_keeps_history() {
    let raw = web1_config();
    let manager = spawn_manager(&raw, None).await;
    feed(&manager, &["ERROR one"]).await;
    let before = manager.query_records("web1", "err", "unknown").await.unwrap();

    let mut repeated = target("web1", true, &["app"]);
    repeated["filters"] = serde_json::json!(["err", "err"]);
    manager
        .stage(raw_config(vec![repeated], err_filter(&[("unknown", 2)])))
        .await
        .unwrap();
    assert_matches!(
        manager.reload().await,
        Err(Error::Config(ConfigError::DuplicateFilterRef { .. }))
    );

    manager.stage(raw).await.unwrap();
    manager.reload().await.unwrap();
    assert_eq!(
        manager.query_records("web1", "err", "unknown").await.unwrap(),
        before
    );
    assert!(before[0].summary.starts_with("total:1 "));
}

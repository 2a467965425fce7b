//! Lines pushed by an agent flow through the filter pipeline into history

use pretty_assertions::assert_eq;
use serde_json::json;
use tailwatch::{filter::RecordRow, transport::channel_stream};

use crate::helpers::*;

fn row(summary: &str, message: &str) -> RecordRow {
    RecordRow {
        summary: summary.to_string(),
        message: message.to_string(),
    }
}

#[tokio::test]
async fn test_matching_lines_fill_bounded_history() {
    let manager = spawn_manager(&web1_config(), None).await;
    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    assert!(sender.send_lines(["INFO started", "ERROR disk full", "ERROR timeout"]));
    assert!(sender.send_lines(["ERROR refused"]));

    eventually(|| async {
        manager
            .query_records("web1", "err", "unknown")
            .await
            .map(|rows| rows.len() == 3)
            .unwrap_or(false)
    })
    .await;

    let rows = manager.query_records("web1", "err", "unknown").await.unwrap();
    assert_eq!(
        rows,
        vec![
            row("total:3 ignore:0 print:3", "known:0"),
            row("unknown", "ERROR refused"),
            row("unknown", "ERROR timeout"),
        ]
    );
}

/// `check_unknown` matches only while no known error code was seen on the line
const CODES_SCRIPT: &str = r#"
    known_codes = 0

    function check_error(line)
        return string.find(line, "ERROR", 1, true) ~= nil
    end

    function check_unknown(line)
        known_codes = 0
        for _ in string.gmatch(line, "E%d%d%d") do
            known_codes = known_codes + 1
        end
        return known_codes == 0, "u"
    end
"#;

#[tokio::test]
async fn test_unmatched_error_line_then_eviction() {
    let filter = json!({
        "id": "err",
        "script": CODES_SCRIPT,
        "check_function_name": "check_error",
        "sub_filters": [{
            "id": "unknown",
            "amount": 2,
            "check_function_name": "check_unknown"
        }]
    });
    let raw = raw_config(vec![target("web1", true, &["app"])], filter);
    let manager = spawn_manager(&raw, None).await;
    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    // L1 passes the gate but carries a known code
    assert!(sender.send_lines(["ERROR E503 L1", "ERROR L2", "ERROR L3", "ERROR L4"]));

    eventually(|| async {
        manager
            .query_records("web1", "err", "unknown")
            .await
            .map(|rows| rows[0].summary == "total:3 ignore:0 print:3")
            .unwrap_or(false)
    })
    .await;

    let rows = manager.query_records("web1", "err", "unknown").await.unwrap();
    assert_eq!(
        rows,
        vec![
            row("total:3 ignore:0 print:3", ""),
            row("u", "ERROR L4"),
            row("u", "ERROR L3"),
        ]
    );
}

#[tokio::test]
async fn test_ignored_matches_are_counted_only() {
    let raw = raw_config(
        vec![target("web1", true, &["app"])],
        err_filter(&[("unknown", 5), ("noisy", 5)]),
    );
    let manager = spawn_manager(&raw, None).await;
    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    sender.send_lines(["ERROR noisy retry", "ERROR noisy retry", "", "ERROR real"]);

    eventually(|| async {
        manager
            .query_records("web1", "err", "unknown")
            .await
            .map(|rows| rows.len() == 4)
            .unwrap_or(false)
    })
    .await;

    let noisy = manager.query_records("web1", "err", "noisy").await.unwrap();
    assert_eq!(noisy, vec![row("total:2 ignore:2 print:0", "")]);
}

#[tokio::test]
async fn test_gate_miss_leaves_counters_alone() {
    let manager = spawn_manager(&web1_config(), None).await;
    let (sender, stream) = channel_stream("agent");
    manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();

    // the last line proves the earlier frame was evaluated
    sender.send_lines(["INFO a", "WARN b", "DEBUG c"]);
    sender.send_lines(["ERROR marker"]);

    eventually(|| async {
        manager
            .query_records("web1", "err", "unknown")
            .await
            .map(|rows| rows.len() == 2)
            .unwrap_or(false)
    })
    .await;

    let rows = manager.query_records("web1", "err", "unknown").await.unwrap();
    assert_eq!(rows[0], row("total:1 ignore:0 print:1", "known:0"));
}

#[tokio::test]
async fn test_unknown_record_lookups_fail() {
    let manager = spawn_manager(&web1_config(), None).await;
    assert!(manager.query_records("web9", "err", "unknown").await.is_err());
    assert!(manager.query_records("web1", "nope", "unknown").await.is_err());
    assert!(manager.query_records("web1", "err", "nope").await.is_err());
}

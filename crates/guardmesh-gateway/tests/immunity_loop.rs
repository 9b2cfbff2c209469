//! End-to-end immunity loop: a blocked payload is learned, committed to
//! the replication log, and visible through the store — driven through a
//! fully wired node with a scripted guardian model.

use async_trait::async_trait;
use guardmesh_core::config::GuardianConfig;
use guardmesh_core::Result as GuardResult;
use guardmesh_gateway::hook::{before_tool_call, HookContext, ToolCallEvent};
use guardmesh_gateway::AppState;
use guardmesh_security::LanguageModel;
use std::sync::Arc;
use std::time::Duration;

/// Scripted model: judges every payload unsafe, categorises everything as
/// SQL injection.
struct HostileJudge;

#[async_trait]
impl LanguageModel for HostileJudge {
    async fn complete(&self, system: &str, _user: &str) -> GuardResult<String> {
        if system.contains("security validator") {
            Ok(r#"{"result": false, "confidence": 0.96, "flags": ["sql_injection"]}"#.to_string())
        } else {
            Ok(r#"{"category": "sql_injection", "severity": "high", "normalized_pattern": null}"#
                .to_string())
        }
    }
}

async fn wired_node(dir: &tempfile::TempDir) -> Arc<AppState> {
    let mut config = GuardianConfig::default();
    config.data_dir = dir.path().to_string_lossy().into_owned();
    // Flush every record immediately so the test does not wait a timer
    // interval.
    config.attack_trigger.batch_size = 1;
    config.attack_trigger.flush_interval_ms = 100;
    AppState::build_with_model(config, Arc::new(HostileJudge))
        .await
        .unwrap()
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{what} did not happen within the deadline");
}

#[tokio::test]
async fn blocked_payload_is_learned_once_and_committed_as_a_block() {
    let dir = tempfile::tempdir().unwrap();
    let state = wired_node(&dir).await;

    let payload = "UNION SELECT * FROM users --";
    let event = ToolCallEvent {
        tool_name: "bash".to_string(),
        params: serde_json::json!({"command": payload})
            .as_object()
            .cloned()
            .unwrap(),
    };

    // Regex catches the literal UNION SELECT, so this block comes from
    // stage 1; the guardian stub is there for the learning path.
    let decision = before_tool_call(&state, &event, &HookContext::default())
        .await
        .expect("attack must be blocked");
    assert!(decision.block);

    // A regex block alone is KNOWN_PATTERN (not learned). Push the same
    // payload through the guardian path instead: phrase it so no regex
    // rule fires.
    let paraphrase = "list every row of the users table bypassing the login check";
    let event = ToolCallEvent {
        tool_name: "bash".to_string(),
        params: serde_json::json!({"command": paraphrase})
            .as_object()
            .cloned()
            .unwrap(),
    };
    let decision = before_tool_call(&state, &event, &HookContext::default())
        .await
        .expect("guardian must block the paraphrase");
    assert!(decision.block_reason.starts_with("GUARDIAN_BLOCKED:"));

    // The AI block flows trigger -> learner -> store -> ledger.
    {
        let store = Arc::clone(&state.store);
        wait_for("fingerprint learned", || {
            store.try_read().is_ok_and(|s| s.total_patterns() == 1)
        })
        .await;
    }
    assert!(state.store.read().await.contains(paraphrase));

    // Exactly one block was appended on top of genesis, carrying the
    // learned fingerprint.
    wait_for("block committed", || {
        state.ledger.try_lock().is_ok_and(|l| l.len() == 2)
    })
    .await;
    let ledger = state.ledger.lock().await;
    let tip = ledger.latest();
    assert_eq!(tip.index, 1);
    assert_eq!(tip.patterns.len(), 1);
    assert_eq!(tip.patterns[0].category, "sql_injection");

    // Learning the same payload again reports a duplicate: the store
    // still holds exactly one fingerprint.
    drop(ledger);
    let record = guardmesh_core::AttackRecord::new(
        guardmesh_core::AttackSource::Ai,
        paraphrase,
        guardmesh_core::Severity::High,
    );
    let outcome = state.learner.learn(&record).await.unwrap();
    assert_eq!(outcome, guardmesh_fleet::learn::LearnOutcome::Duplicate);
    assert_eq!(state.store.read().await.total_patterns(), 1);

    state.shutdown();
}

#[tokio::test]
async fn regex_blocks_are_not_learned() {
    let dir = tempfile::tempdir().unwrap();
    let state = wired_node(&dir).await;

    let event = ToolCallEvent {
        tool_name: "bash".to_string(),
        params: serde_json::json!({"command": "rm -rf / now"})
            .as_object()
            .cloned()
            .unwrap(),
    };
    let decision = before_tool_call(&state, &event, &HookContext::default())
        .await
        .unwrap();
    assert_eq!(decision.block_reason, "REGEX_MATCH: rm_rf");

    // KNOWN_PATTERN: nothing reaches the learner.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state.store.read().await.total_patterns(), 0);
    assert_eq!(state.ledger.lock().await.len(), 1);

    state.shutdown();
}

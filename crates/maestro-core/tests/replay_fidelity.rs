//! End-to-end check that a replayed session reproduces the live outbound
//! stream exactly.

use maestro_core::testing::StubRunner;
use maestro_core::{replay_session, MaestroConfig, RunnerFactory, Server, State};
use serde_json::{json, Value};
use tempfile::TempDir;

fn parse_lines(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_replay_matches_live_outbound_stream() {
    let tmp = TempDir::new().unwrap();
    let factory: RunnerFactory = Box::new(|_| Box::new(StubRunner::succeeding()));
    let mut server = Server::new(Vec::new(), MaestroConfig::default(), factory, "0.0.0-test")
        .with_workspace(tmp.path());

    server
        .handle_line(json!({
            "type": "INIT", "sessionId": "s-e2e",
            "payload": {"workspaceRoot": tmp.path().to_str().unwrap(), "client": "editor"}
        }))
        .await
        .unwrap();
    server
        .handle_line(json!({
            "type": "USER_PROMPT", "sessionId": "s-e2e",
            "payload": {"text": "add a hello file"}
        }))
        .await
        .unwrap();
    server
        .handle_line(json!({
            "type": "APPLY_EDIT_RESULT", "sessionId": "s-e2e",
            "payload": {"applied": true, "fileResults": [{"filePath": "maestro/TASK.md", "ok": true}]}
        }))
        .await
        .unwrap();

    assert_eq!(server.state(), Some(State::Done));

    let live = parse_lines(server.out());
    let kinds: Vec<&str> = live.iter().map(|v| v["type"].as_str().unwrap()).collect();
    assert!(kinds.contains(&"PROPOSE_EDIT"));
    assert!(kinds.contains(&"TOOL_OUTPUT"));
    assert_eq!(*kinds.last().unwrap(), "STATUS");

    let propose = live.iter().find(|v| v["type"] == "PROPOSE_EDIT").unwrap();
    let edits = propose["payload"]["edits"].as_array().unwrap();
    assert!(!edits.is_empty());
    assert_eq!(edits[0]["filePath"], "maestro/TASK.md");

    // Replay from the recorded log and compare message for message.
    let session_dir = server.session_dir().unwrap();
    let mut replay_out = Vec::new();
    let summary = replay_session(&session_dir, &mut replay_out).unwrap();

    let replayed = parse_lines(&replay_out);
    assert_eq!(replayed, live);
    assert_eq!(summary.emitted, live.len());

    let report = std::fs::read_to_string(session_dir.join("replay_report.md")).unwrap();
    assert!(report.contains("Replay Report"));
    assert!(report.contains("in:USER_PROMPT"));
    assert!(report.contains("out:PROPOSE_EDIT"));
}

use tempfile::tempdir;

use anvil_agent::{SessionSeed, SessionStore};
use anvil_llm::{ChatMessage, MessageSource, Role, Usage};

fn seed() -> SessionSeed {
    SessionSeed {
        provider: "openai".to_string(),
        model: "gpt-4o".to_string(),
        workspace_dir: "/work".to_string(),
        parent_session_id: None,
        subagent_depth: 0,
    }
}

#[test]
fn journal_is_one_json_record_per_line_with_a_leading_header() {
    let dir = tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path()).expect("store");
    store.open("s1", &seed()).expect("open");
    store
        .append("s1", ChatMessage::user("hello"))
        .expect("append user");
    store
        .append("s1", ChatMessage::assistant("hi"))
        .expect("append assistant");

    let raw = std::fs::read_to_string(store.session_path("s1")).expect("journal readable");
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 3);

    let header: serde_json::Value = serde_json::from_str(lines[0]).expect("header json");
    assert_eq!(header.get("type").and_then(|v| v.as_str()), Some("header"));
    assert_eq!(
        header.get("session_id").and_then(|v| v.as_str()),
        Some("s1")
    );
    assert_eq!(
        header.get("provider").and_then(|v| v.as_str()),
        Some("openai")
    );

    let message: serde_json::Value = serde_json::from_str(lines[1]).expect("message json");
    assert_eq!(message.get("type").and_then(|v| v.as_str()), Some("message"));
    assert_eq!(
        message.pointer("/message/role").and_then(|v| v.as_str()),
        Some("user")
    );
}

#[test]
fn missing_sessions_auto_initialize_on_first_append() {
    let dir = tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path()).expect("store");
    store
        .append("fresh", ChatMessage::user("first"))
        .expect("append without open");

    let snapshot = store.snapshot("fresh").expect("snapshot");
    assert_eq!(snapshot.messages.len(), 1);
    assert!(store.session_path("fresh").is_file());
}

#[test]
fn replace_prefix_swaps_old_messages_for_the_summary() {
    let dir = tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path()).expect("store");
    store.open("s1", &seed()).expect("open");
    for i in 0..6 {
        store
            .append("s1", ChatMessage::user(format!("m{i}")))
            .expect("append");
    }

    let summary = ChatMessage::system("[Compacted conversation summary]\n- user: m0")
        .with_source(MessageSource::Compaction);
    store.replace_prefix("s1", 4, summary).expect("replace");

    let snapshot = store.snapshot("s1").expect("snapshot");
    assert_eq!(snapshot.messages.len(), 3);
    assert_eq!(snapshot.messages[0].role, Role::System);
    assert_eq!(snapshot.messages[0].source, Some(MessageSource::Compaction));
    assert_eq!(snapshot.messages[1].content, "m4");
    assert_eq!(snapshot.messages[2].content, "m5");

    // Rewrite went through the temp file and renamed over the original.
    assert!(!dir.path().join("s1.jsonl.tmp").exists());

    // Reload from disk shows the same post-rewrite state.
    let reloaded = SessionStore::new(dir.path()).expect("store");
    let snapshot = reloaded.open("s1", &seed()).expect("reopen");
    assert_eq!(snapshot.messages.len(), 3);
    assert_eq!(snapshot.messages[1].content, "m4");
}

#[test]
fn update_header_persists_usage_counters() {
    let dir = tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path()).expect("store");
    store.open("s1", &seed()).expect("open");
    store
        .update_header("s1", |header| {
            header.accumulate_usage(&Usage {
                input_tokens: 7,
                output_tokens: 3,
                total_tokens: 10,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            });
        })
        .expect("update header");

    let reloaded = SessionStore::new(dir.path()).expect("store");
    let header = reloaded.open("s1", &seed()).expect("reopen").header;
    assert_eq!(header.usage_input_tokens, 7);
    assert_eq!(header.usage_total_tokens, 10);
}

#[test]
fn corrupt_journal_lines_are_skipped_on_load() {
    let dir = tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path()).expect("store");
    store.open("s1", &seed()).expect("open");
    store
        .append("s1", ChatMessage::user("kept"))
        .expect("append");

    // Inject garbage between valid records.
    let path = store.session_path("s1");
    let mut raw = std::fs::read_to_string(&path).expect("read journal");
    raw.push_str("{this is not json\n");
    std::fs::write(&path, raw).expect("write journal");

    let reloaded = SessionStore::new(dir.path()).expect("store");
    let snapshot = reloaded.open("s1", &seed()).expect("reopen");
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "kept");
}

#[test]
fn reset_clears_messages_but_keeps_the_header() {
    let dir = tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path()).expect("store");
    store.open("s1", &seed()).expect("open");
    store
        .append("s1", ChatMessage::user("gone soon"))
        .expect("append");

    store.reset("s1").expect("reset");
    let snapshot = store.snapshot("s1").expect("snapshot");
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.header.session_id, "s1");
}

#[test]
fn tool_messages_round_trip_their_pairing_fields() {
    let dir = tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path()).expect("store");
    store.open("s1", &seed()).expect("open");
    store
        .append(
            "s1",
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![anvil_llm::ToolCall::new("tc9", "run_cmd", "{}")],
            ),
        )
        .expect("append assistant");
    store
        .append(
            "s1",
            ChatMessage::tool_result("tc9", Some("run_cmd".to_string()), "[exit code: 0]"),
        )
        .expect("append tool");

    let reloaded = SessionStore::new(dir.path()).expect("store");
    let snapshot = reloaded.open("s1", &seed()).expect("reopen");
    assert_eq!(snapshot.messages[0].calls()[0].id, "tc9");
    assert_eq!(snapshot.messages[1].tool_call_id.as_deref(), Some("tc9"));
    assert_eq!(snapshot.messages[1].name.as_deref(), Some("run_cmd"));
}

mod support;

use std::sync::Arc;

use tempfile::tempdir;

use anvil_agent::{Agent, AgentHooks, BufferedEventSink, ContextMode};
use anvil_llm::{ChatMessage, MessageSource, Role};

use support::{assistant_text, test_config, ScriptedProvider};

/// S5: a 1000-char history under a 200-char cap is compacted into one
/// summary message plus the kept tail, and the provider sees at most the
/// cap.
#[tokio::test]
async fn oversized_history_is_compacted_before_the_provider_call() {
    let dir = tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.context.mode = ContextMode::Chars;
    config.context.max_chars = 200;
    config.context.compact_trigger_chars = 300;
    config.context.keep_last_messages = 2;
    config.context.compact_keep_tail = 2;

    let provider = ScriptedProvider::new(vec![assistant_text("ack")]);
    let sink = BufferedEventSink::default();
    let agent = Agent::builder(provider.clone())
        .config(config)
        .session_id("compactable")
        .event_sink(Arc::new(sink))
        .build()
        .expect("agent builds");

    // Twenty synthetic turns summing to 1000 chars.
    let store = agent.runtime().store();
    for i in 0..20 {
        let content = "x".repeat(50);
        let message = if i % 2 == 0 {
            ChatMessage::user(content)
        } else {
            ChatMessage::assistant(content)
        };
        store.append(agent.session_id(), message).expect("seed");
    }

    agent.chat("next").await.expect("chat succeeds");

    // Journal prefix was replaced by exactly one summary message.
    let snapshot = agent.snapshot().expect("snapshot");
    assert_eq!(snapshot.messages[0].source, Some(MessageSource::Compaction));
    assert!(snapshot.messages[0]
        .content
        .starts_with("[Compacted conversation summary]"));
    let summaries = snapshot
        .messages
        .iter()
        .filter(|message| message.source == Some(MessageSource::Compaction))
        .count();
    assert_eq!(summaries, 1);

    // summary + last 2 seeded-or-injected messages + assistant reply.
    assert_eq!(snapshot.messages.len(), 4);
    assert_eq!(snapshot.messages[3].role, Role::Assistant);
    assert_eq!(snapshot.messages[3].content, "ack");

    // The provider saw the compacted view, within the cap.
    let requests = provider.requests();
    let sent = &requests[0].messages;
    assert_eq!(sent[0].role, Role::System);
    let context_chars: usize = sent[1..].iter().map(|message| message.content.len()).sum();
    assert!(
        context_chars <= 200,
        "provider context measured {context_chars} chars"
    );
    assert_eq!(sent[1].source, Some(MessageSource::Compaction));
}

/// A `transform_context` hook must not block journal compaction: the view
/// is prepared and persisted against the stored history, then the hook sees
/// the compacted copy.
#[tokio::test]
async fn transform_hook_does_not_block_journal_compaction() {
    let dir = tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.context.max_chars = 200;
    config.context.compact_trigger_chars = 300;
    config.context.keep_last_messages = 2;
    config.context.compact_keep_tail = 2;

    let provider = ScriptedProvider::new(vec![assistant_text("ack")]);
    let hooks = AgentHooks {
        transform_context: Some(Arc::new(|mut messages: Vec<ChatMessage>| {
            messages.push(ChatMessage::assistant("transform-marker"));
            messages
        })),
        ..AgentHooks::default()
    };
    let agent = Agent::builder(provider.clone())
        .config(config)
        .session_id("compactable")
        .hooks(hooks)
        .build()
        .expect("agent builds");
    let store = agent.runtime().store();
    for _ in 0..20 {
        store
            .append(agent.session_id(), ChatMessage::user("z".repeat(50)))
            .expect("seed");
    }

    agent.chat("next").await.expect("chat succeeds");

    // The journal prefix was replaced despite the installed hook.
    let snapshot = agent.snapshot().expect("snapshot");
    assert_eq!(snapshot.messages[0].source, Some(MessageSource::Compaction));
    let summaries = snapshot
        .messages
        .iter()
        .filter(|message| message.source == Some(MessageSource::Compaction))
        .count();
    assert_eq!(summaries, 1);
    // summary + kept tail (seeded message + "next") + assistant reply.
    assert_eq!(snapshot.messages.len(), 4);

    // The hook ran on the compacted view that went to the provider.
    let requests = provider.requests();
    let sent = &requests[0].messages;
    assert_eq!(sent[1].source, Some(MessageSource::Compaction));
    assert!(sent.iter().any(|message| message.content == "transform-marker"));

    // A second turn does not grow the journal with another summary.
    provider.push_response(assistant_text("again"));
    agent.chat("once more").await.expect("chat succeeds");
    let snapshot = agent.snapshot().expect("snapshot");
    let summaries = snapshot
        .messages
        .iter()
        .filter(|message| message.source == Some(MessageSource::Compaction))
        .count();
    assert_eq!(summaries, 1);
}

/// The journal on disk reflects the rewrite: header first, summary second.
#[tokio::test]
async fn compaction_rewrites_the_journal_atomically() {
    let dir = tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.context.max_chars = 200;
    config.context.compact_trigger_chars = 300;
    config.context.keep_last_messages = 2;
    config.context.compact_keep_tail = 2;

    let provider = ScriptedProvider::new(vec![assistant_text("ack")]);
    let agent = Agent::builder(provider)
        .config(config)
        .session_id("compactable")
        .build()
        .expect("agent builds");
    let store = agent.runtime().store();
    for _ in 0..20 {
        store
            .append(agent.session_id(), ChatMessage::user("y".repeat(50)))
            .expect("seed");
    }

    agent.chat("next").await.expect("chat succeeds");

    let journal = std::fs::read_to_string(store.session_path(agent.session_id()))
        .expect("journal readable");
    let lines: Vec<&str> = journal.lines().collect();
    let header: serde_json::Value = serde_json::from_str(lines[0]).expect("header json");
    assert_eq!(header.get("type").and_then(|v| v.as_str()), Some("header"));
    let first_message: serde_json::Value = serde_json::from_str(lines[1]).expect("message json");
    assert_eq!(
        first_message
            .pointer("/message/source")
            .and_then(|v| v.as_str()),
        Some("compaction")
    );
    // No temp file left behind after the rename.
    assert!(!dir.path().join("compactable.jsonl.tmp").exists());
}

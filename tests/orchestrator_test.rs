//! Integration tests for the session orchestrator: send/cancel lifecycle,
//! crash discipline, and notification ordering.

mod common;

use serde_json::json;


use durachat::client::{ChatStreamEvent, ClientError, RemoteMessage};
use durachat::notify::Notification;
use durachat::orchestrator::OrchestratorError;
use durachat::store::{HistoryStore, Role, Session};

use common::{TEST_USER, delta, next_notification, setup};

async fn seeded_session(store: &dyn HistoryStore) -> String {
    let session = store.put_session(Session::new(TEST_USER)).await.unwrap();
    session.id
}

#[tokio::test]
async fn user_message_is_persisted_before_network_failure() {
    let (orchestrator, api, store, mut feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;
    api.set_offline(true);

    let result = orchestrator.send(&session_id, "你好吗").await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Client(ClientError::Network(_)))
    ));

    // The user turn survived even though the send never reached the network.
    let messages = store.messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "你好吗");

    // Append events first, then exactly one user-facing error.
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::MessageAppended { .. }
    ));
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::SessionListChanged { .. }
    ));
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::Error { .. }
    ));
    assert!(feed.try_recv().is_err());
}

#[tokio::test]
async fn completed_stream_persists_reply_with_tool_calls() {
    let (orchestrator, api, store, mut feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    api.queue_events(vec![
        delta("为您查询"),
        ChatStreamEvent::ToolCallStart {
            tool_name: "knowledge_base".to_string(),
            parameters: json!({"query": "电梯保养"}),
        },
        ChatStreamEvent::ToolCallEnd {
            tool_name: "knowledge_base".to_string(),
            parameters: json!({"query": "电梯保养"}),
            result: json!({"hits": 3}),
        },
        delta("：每月一次"),
    ]);

    let reply = orchestrator
        .send(&session_id, "电梯保养周期")
        .await
        .unwrap()
        .expect("reply persisted");

    assert_eq!(reply.content, "为您查询：每月一次");
    assert!(!reply.incomplete);
    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].tool_name, "knowledge_base");
    assert_eq!(reply.tool_calls[0].result, Some(json!({"hits": 3})));

    let messages = store.messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 2);

    // Notification order mirrors decode order.
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::MessageAppended { .. }
    ));
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::SessionListChanged { .. }
    ));
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::DeltaApplied { .. }
    ));
    match next_notification(&mut feed).await {
        Notification::ToolEvent { invocation, .. } => assert!(invocation.result.is_none()),
        other => panic!("expected tool start, got {other:?}"),
    }
    match next_notification(&mut feed).await {
        Notification::ToolEvent { invocation, .. } => assert!(invocation.result.is_some()),
        other => panic!("expected tool end, got {other:?}"),
    }
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::DeltaApplied { .. }
    ));
    match next_notification(&mut feed).await {
        Notification::MessageAppended { message, .. } => {
            assert_eq!(message.role, Role::Assistant);
        }
        other => panic!("expected reply append, got {other:?}"),
    }
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::SessionListChanged { .. }
    ));
}

#[tokio::test]
async fn cancellation_persists_partial_reply_as_incomplete() {
    let (orchestrator, api, store, mut feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    api.queue_hanging(vec![delta("Hello "), delta("world")]);

    let send_task = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { orchestrator.send(&session_id, "hi").await })
    };

    // Wait until both deltas were decoded, then cancel mid-stream.
    let mut deltas_seen = 0;
    while deltas_seen < 2 {
        if let Notification::DeltaApplied { .. } = next_notification(&mut feed).await {
            deltas_seen += 1;
        }
    }
    assert!(orchestrator.cancel(&session_id));

    let reply = send_task
        .await
        .unwrap()
        .unwrap()
        .expect("partial reply persisted");
    assert!(reply.incomplete);
    assert_eq!(reply.content, "Hello world");

    // Exactly one assistant message, holding exactly the accumulated deltas.
    let assistant: Vec<_> = store
        .messages(&session_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].content, "Hello world");
    assert!(assistant[0].incomplete);

    // Session is idle and usable again.
    assert!(!orchestrator.is_busy(&session_id));
}

#[tokio::test]
async fn second_send_is_rejected_while_in_flight() {
    let (orchestrator, api, store, mut feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    api.queue_hanging(vec![delta("thinking")]);

    let send_task = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { orchestrator.send(&session_id, "first").await })
    };

    // The first delta proves the send is in flight.
    loop {
        if let Notification::DeltaApplied { .. } = next_notification(&mut feed).await {
            break;
        }
    }
    assert!(orchestrator.is_busy(&session_id));

    let second = orchestrator.send(&session_id, "second").await;
    assert!(matches!(second, Err(OrchestratorError::Busy(_))));

    orchestrator.cancel(&session_id);
    send_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn stream_abort_keeps_accumulated_content() {
    let (orchestrator, api, store, _feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    api.queue_results(vec![
        Ok(delta("部分回复")),
        Err(ClientError::StreamAborted("connection reset".to_string())),
    ]);

    let reply = orchestrator
        .send(&session_id, "hi")
        .await
        .unwrap()
        .expect("partial reply persisted");

    assert!(reply.incomplete);
    assert_eq!(reply.content, "部分回复");
}

#[tokio::test]
async fn stream_error_event_marks_text_and_stream_continues() {
    let (orchestrator, api, store, _feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    api.queue_events(vec![
        delta("已查到结果"),
        ChatStreamEvent::Error {
            error: "tool timeout".to_string(),
        },
        delta("，请稍后重试"),
    ]);

    let reply = orchestrator
        .send(&session_id, "查询")
        .await
        .unwrap()
        .expect("reply persisted");

    assert_eq!(reply.content, "已查到结果\n❌ 错误: tool timeout，请稍后重试");
    assert!(!reply.incomplete);
}

#[tokio::test]
async fn empty_stream_persists_no_assistant_message() {
    let (orchestrator, api, store, _feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    api.queue_events(vec![]);

    let reply = orchestrator.send(&session_id, "hi").await.unwrap();
    assert!(reply.is_none());

    let messages = store.messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn create_session_writes_through_to_store() {
    let (orchestrator, _api, store, mut feed) = setup();

    let session = orchestrator.create_session().await.unwrap();
    assert_eq!(session.id, "session_remote1");
    assert!(store.get_session(&session.id).await.unwrap().is_some());
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::SessionListChanged { .. }
    ));
}

#[tokio::test]
async fn create_session_offline_falls_back_to_pending() {
    let (orchestrator, api, store, _feed) = setup();
    api.set_offline(true);

    let session = orchestrator.create_session().await.unwrap();
    assert_eq!(session.metadata.get("pending"), Some(&json!(true)));
    assert!(store.get_session(&session.id).await.unwrap().is_some());
}

#[tokio::test]
async fn sync_history_merges_idempotently() {
    let (orchestrator, api, store, _feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    let history: Vec<RemoteMessage> = serde_json::from_value(json!([
        {"id": "msg_a", "role": "user", "content": "你好", "timestamp": "2026-01-05T09:00:00Z"},
        {"id": "msg_b", "role": "assistant", "content": "您好，有什么可以帮您", "timestamp": "2026-01-05T09:00:05Z"}
    ]))
    .unwrap();
    api.set_history(history);

    orchestrator.sync_history(&session_id).await.unwrap();
    orchestrator.sync_history(&session_id).await.unwrap();

    let messages = store.messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "msg_a");
    assert_eq!(messages[1].id, "msg_b");
}

#[tokio::test]
async fn delete_session_notifies_the_sink() {
    let (orchestrator, _api, store, mut feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    orchestrator.delete_session(&session_id).await.unwrap();
    assert!(store.get_session(&session_id).await.unwrap().is_none());
    assert!(matches!(
        next_notification(&mut feed).await,
        Notification::SessionListChanged { .. }
    ));
}

#[tokio::test]
async fn title_is_derived_after_first_user_turn() {
    let (orchestrator, api, store, _feed) = setup();
    let session_id = seeded_session(store.as_ref()).await;

    api.queue_events(vec![delta("请联系维保单位")]);
    orchestrator
        .send(&session_id, "电梯故障了怎么办")
        .await
        .unwrap();

    let session = store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.title, "维修服务");
}

#[tokio::test]
async fn concurrent_sends_to_different_sessions_do_not_interfere() {
    let (orchestrator, api, store, _feed) = setup();
    let first = seeded_session(store.as_ref()).await;
    let second = seeded_session(store.as_ref()).await;

    api.queue_events(vec![delta("reply one")]);
    api.queue_events(vec![delta("reply two")]);

    let a = {
        let orchestrator = orchestrator.clone();
        let first = first.clone();
        tokio::spawn(async move { orchestrator.send(&first, "one").await })
    };
    let b = {
        let orchestrator = orchestrator.clone();
        let second = second.clone();
        tokio::spawn(async move { orchestrator.send(&second, "two").await })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(store.messages(&first).await.unwrap().len(), 2);
    assert_eq!(store.messages(&second).await.unwrap().len(), 2);
}

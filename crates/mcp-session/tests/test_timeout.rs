mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use mcp_session::{
    RequestOptions, ServiceError,
    model::{ErrorCode, Progress},
};
use serde_json::{Value, json};
use tokio::time::advance;

fn progress_log() -> (Arc<Mutex<Vec<Progress>>>, impl Fn(Progress) + Send + Sync) {
    let log: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (log, move |progress| sink.lock().unwrap().push(progress))
}

#[tokio::test(start_paused = true)]
async fn test_per_call_timeout_rejects_and_notifies_peer() -> anyhow::Result<()> {
    let (session, transport) = connected().await;

    let task = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .request::<Value>(
                    TestMessage::new("slow"),
                    RequestOptions::default().with_timeout(Duration::from_millis(50)),
                )
                .await
        }
    });
    flush().await;
    assert_eq!(transport.sent_len(), 1);

    // the peer never answers; awaiting drives the clock to the deadline
    let error = task.await?.unwrap_err();
    match error {
        ServiceError::McpError(data) => {
            assert_eq!(data.code, ErrorCode::REQUEST_TIMEOUT);
            assert_eq!(data.data.unwrap()["timeout"], 50);
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    let cancellation = sent[1].clone().into_notification().unwrap();
    assert_eq!(cancellation.method, "notifications/cancelled");
    let params = cancellation.params.unwrap();
    assert_eq!(params["requestId"], 0);
    assert!(params["reason"].as_str().unwrap().contains("Request timed out"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_progress_resets_the_per_call_timer() -> anyhow::Result<()> {
    let (session, transport) = connected().await;
    let (log, on_progress) = progress_log();

    let task = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .request::<Value>(
                    TestMessage::new("stream"),
                    RequestOptions::default()
                        .with_timeout(Duration::from_millis(100))
                        .reset_timeout_on_progress()
                        .on_progress(on_progress),
                )
                .await
        }
    });
    flush().await;

    advance(Duration::from_millis(80)).await;
    transport.deliver_value(json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {"progressToken": 0, "progress": 1.0}
    }));
    flush().await;

    // t = 170ms: the original deadline (100ms) has passed, but the reset
    // rescheduled it to 180ms
    advance(Duration::from_millis(90)).await;
    flush().await;
    assert!(!task.is_finished(), "request must survive past the first deadline");
    assert_eq!(log.lock().unwrap().len(), 1);

    advance(Duration::from_millis(15)).await;
    flush().await;
    assert!(task.is_finished());
    let error = task.await?.unwrap_err();
    match error {
        ServiceError::McpError(data) => assert_eq!(data.code, ErrorCode::REQUEST_TIMEOUT),
        other => panic!("expected timeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_max_total_ceiling_fails_the_breaching_progress() -> anyhow::Result<()> {
    let (session, transport) = connected().await;
    let (log, on_progress) = progress_log();

    let task = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .request::<Value>(
                    TestMessage::new("stream"),
                    RequestOptions::default()
                        .with_timeout(Duration::from_millis(100))
                        .with_max_total_timeout(Duration::from_millis(120))
                        .reset_timeout_on_progress()
                        .on_progress(on_progress),
                )
                .await
        }
    });
    flush().await;

    advance(Duration::from_millis(80)).await;
    transport.deliver_value(json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {"progressToken": 0, "progress": 0.5}
    }));
    flush().await;
    assert!(!task.is_finished());
    assert_eq!(log.lock().unwrap().len(), 1);

    // t = 130ms: past the 120ms ceiling; the next progress event trips it
    advance(Duration::from_millis(50)).await;
    transport.deliver_value(json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {"progressToken": 0, "progress": 0.9}
    }));
    flush().await;

    assert!(task.is_finished());
    let error = task.await?.unwrap_err();
    match error {
        ServiceError::McpError(data) => {
            assert_eq!(data.code, ErrorCode::REQUEST_TIMEOUT);
            let data = data.data.unwrap();
            assert_eq!(data["maxTotalTimeout"], 120);
            assert_eq!(data["totalElapsed"], 130);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(
        log.lock().unwrap().len(),
        1,
        "the breaching progress event is not delivered"
    );

    // exactly one cancellation notification for the whole request
    let cancellations = transport
        .sent()
        .into_iter()
        .filter_map(|message| message.into_notification())
        .filter(|notification| notification.method == "notifications/cancelled")
        .count();
    assert_eq!(cancellations, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_progress_without_reset_does_not_extend() -> anyhow::Result<()> {
    let (session, transport) = connected().await;
    let (log, on_progress) = progress_log();

    let task = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .request::<Value>(
                    TestMessage::new("stream"),
                    RequestOptions::default()
                        .with_timeout(Duration::from_millis(100))
                        .on_progress(on_progress),
                )
                .await
        }
    });
    flush().await;

    advance(Duration::from_millis(80)).await;
    transport.deliver_value(json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {"progressToken": 0, "progress": 0.5}
    }));
    flush().await;
    assert_eq!(log.lock().unwrap().len(), 1);

    advance(Duration::from_millis(25)).await;
    flush().await;
    assert!(task.is_finished(), "without reset the original deadline holds");
    assert!(task.await?.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timer_dies_with_the_response() -> anyhow::Result<()> {
    let (session, transport) = connected().await;

    let task = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .request::<Value>(
                    TestMessage::new("quick"),
                    RequestOptions::default().with_timeout(Duration::from_millis(50)),
                )
                .await
        }
    });
    flush().await;
    transport.deliver_value(json!({"jsonrpc": "2.0", "id": 0, "result": {}}));
    task.await??;

    let errors = collect_errors(&session);
    advance(Duration::from_secs(10)).await;
    flush().await;
    assert_eq!(transport.sent_len(), 1, "no cancellation after completion");
    assert!(errors.lock().unwrap().is_empty());
    Ok(())
}

//! The client library against a live server on a loopback port.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use client::{
    ChatClient, ClientPhase, ClientSettings, FileCredentials, HttpTransport, StaticCredentials,
    Submission, TailClient, credentials::CredentialProvider, transport::ChatTransport,
};
use serde_json::json;
use server::{
    AppState, MemoryStores,
    server::{create_app_router, metrics_handle},
};
use shared::{
    config::server::{Config, Profile, StaticToken},
    models::{EventFrame, LogRecord, TailFrame, TailKind, TailQuery},
};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::mpsc};
use url::Url;
use uuid::Uuid;

const ADMIN: &str = "admin-token";
const WRITER: &str = "writer-token";

async fn serve() -> (Url, MemoryStores) {
    let mut config = Config::default_for_profile(Profile::Test);
    config.tail.session_timeout_seconds = 1;
    config.chat.chunk_delay_ms = 5;
    config.auth.tokens = vec![
        StaticToken {
            token: ADMIN.into(),
            subject: "ops".into(),
            is_admin: true,
            expires_at: None,
        },
        StaticToken {
            token: WRITER.into(),
            subject: "writer".into(),
            is_admin: false,
            expires_at: None,
        },
    ];

    let (state, stores) = AppState::in_memory(Arc::new(config));
    let router = create_app_router(Arc::new(state), metrics_handle());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    (Url::parse(&format!("http://{address}/")).unwrap(), stores)
}

fn transport(base: Url, credentials: Arc<dyn CredentialProvider>) -> Arc<HttpTransport> {
    Arc::new(HttpTransport::new(base, credentials).unwrap())
}

#[tokio::test]
async fn chat_generation_streams_into_the_store() {
    let (base, _) = serve().await;
    let http = transport(base, Arc::new(StaticCredentials::new(Some(WRITER.into()))));
    let client = ChatClient::new(http.clone(), ClientSettings::default());

    let session = client
        .submit(Submission::new("streamed over a real socket"))
        .await
        .unwrap();
    let view = session.finished().await;

    assert!(view.error.is_none(), "{:?}", view.error);
    let response = view.latest_response().unwrap();
    assert_eq!(response.text, "streamed over a real socket");
    assert!(!response.unfinished);
    assert!(!response.placeholder);

    let stored = http
        .fetch_messages(session.conversation_id())
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].message_id, response.message_id);
}

#[tokio::test]
async fn cancel_reaches_the_server() {
    let (base, _) = serve().await;
    let http = transport(base, Arc::new(StaticCredentials::new(Some(WRITER.into()))));
    let client = ChatClient::new(http.clone(), ClientSettings::default());

    let words = vec!["word"; 200].join(" ");
    let session = client.submit(Submission::new(words)).await.unwrap();
    let conversation = session.conversation_id();
    assert!(session.wait_for(ClientPhase::Streaming).await);

    assert_eq!(session.cancel().await.unwrap(), "cancelled");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = http.fetch_messages(conversation).await.unwrap();
    assert!(stored[1].aborted);
    assert!(!stored[1].unfinished);
}

#[tokio::test]
async fn rotated_token_file_is_picked_up_after_rejection() {
    let (base, _) = serve().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("token");
    std::fs::write(&path, "revoked-token").unwrap();

    let http = transport(base, Arc::new(FileCredentials::new(path.clone())));
    let conversation = Uuid::new_v4();
    assert!(http.fetch_messages(conversation).await.unwrap_err().is_unauthorized());

    std::fs::write(&path, WRITER).unwrap();
    let client = ChatClient::new(http, ClientSettings::default());
    assert!(client.attach(conversation).await.unwrap().is_none());
}

#[tokio::test]
async fn tail_client_follows_backlog_and_live_records() {
    let (base, stores) = serve().await;
    for id in 1..=3 {
        stores
            .logs
            .seed(LogRecord {
                id: id.to_string(),
                timestamp: Utc.timestamp_opt(1_714_550_400 + id, 0).unwrap(),
                level: "info".into(),
                message: format!("backlog {id}"),
                meta: json!({}),
            })
            .await;
    }

    let http = transport(base, Arc::new(StaticCredentials::new(Some(ADMIN.into()))));
    let mut tail = TailClient::new(http, 0);
    let (tx, mut rx) = mpsc::channel(64);
    let follower = tokio::spawn(async move {
        tail.follow(TailKind::Logs, &TailQuery::default(), tx).await
    });

    let mut historical = Vec::new();
    while let Some(frame) = rx.recv().await {
        if frame.is_historical_complete() {
            break;
        }
        if let TailFrame::Event(EventFrame::HistoricalLog(record)) = frame {
            historical.push(record.id);
        }
    }
    assert_eq!(historical, ["1", "2", "3"]);

    stores
        .logs
        .insert(LogRecord {
            id: "4".into(),
            timestamp: Utc::now(),
            level: "warn".into(),
            message: "live".into(),
            meta: json!({}),
        })
        .await;

    let mut live = Vec::new();
    while let Some(frame) = rx.recv().await {
        if let TailFrame::Event(EventFrame::RealtimeLog(record)) = frame {
            live.push(record.id);
        }
    }
    assert_eq!(live, ["4"]);
    follower.await.unwrap().unwrap();
}

use blob_fetcher::{start_download_from, BlobStore, FailureKind, Session, TransferError, TransferOptions};
use futures::{channel::mpsc, StreamExt};
use httpmock::prelude::*;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

fn isolated() -> Session {
    Session::builder().with_store(BlobStore::new()).build()
}

async fn wait_until_active(session: &Session) {
    while !session.is_active() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn downloads_body_with_content_type() {
    let body: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/report.pdf");
            then.status(200).header("content-type", "application/pdf").body(&body);
        })
        .await;

    let session = isolated();
    let percents = Arc::new(Mutex::new(Vec::new()));
    let content_type = Arc::new(Mutex::new(None));
    let options = TransferOptions::new()
        .on_progress({
            let percents = percents.clone();
            move |_, percent| percents.lock().unwrap().push(percent)
        })
        .on_success({
            let content_type = content_type.clone();
            move |_, _, declared| *content_type.lock().unwrap() = declared.map(str::to_owned)
        });

    let handle = session.start(server.url("/report.pdf"), options).await.unwrap();

    mock.assert_async().await;
    let blob = handle.blob().unwrap();
    assert_eq!(blob.bytes().as_ref(), body.as_slice());
    assert_eq!(blob.content_type(), Some("application/pdf"));
    assert_eq!(content_type.lock().unwrap().as_deref(), Some("application/pdf"));
    assert_eq!(session.store().resolve_url(&handle.url()), Some(blob));

    let percents = percents.lock().unwrap();
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn not_found_fails_with_status() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/missing");
            then.status(404);
        })
        .await;

    let session = isolated();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let succeeded = Arc::new(Mutex::new(false));
    let options = TransferOptions::new()
        .on_failed({
            let failures = failures.clone();
            move |_, kind, message| failures.lock().unwrap().push((kind, message.to_owned()))
        })
        .on_success({
            let succeeded = succeeded.clone();
            move |_, _, _| *succeeded.lock().unwrap() = true
        });

    let result = session.start(server.url("/missing"), options).await;

    assert!(matches!(result, Err(TransferError::Status(status)) if status.as_u16() == 404));
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, FailureKind::Error);
    assert!(failures[0].1.contains("404"), "{}", failures[0].1);
    assert!(!*succeeded.lock().unwrap());
    assert!(session.payload().is_none());
    assert_eq!(session.store().live_count(), 0);
}

#[tokio::test]
async fn merges_default_and_transfer_headers() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/private")
                .header("x-client", "blob-fetcher")
                .header("authorization", "Bearer transfer");
            then.status(200).body("secret");
        })
        .await;

    let mut defaults = HeaderMap::new();
    defaults.insert("x-client", HeaderValue::from_static("blob-fetcher"));
    defaults.insert(AUTHORIZATION, HeaderValue::from_static("Bearer session"));
    let session = Session::builder()
        .with_store(BlobStore::new())
        .with_default_headers(defaults)
        .build();
    let options = TransferOptions::new().with_header("authorization", "Bearer transfer").unwrap();

    let handle = session.start(server.url("/private"), options).await.unwrap();

    mock.assert_async().await;
    assert_eq!(handle.blob().unwrap().bytes().as_ref(), b"secret");
}

#[tokio::test]
async fn second_transfer_supersedes_first_handle() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/a");
            then.status(200).body("first");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/b");
            then.status(200).body("second");
        })
        .await;

    let session = isolated();
    let first = session.start(server.url("/a"), TransferOptions::new()).await.unwrap();
    let second = session.start(server.url("/b"), TransferOptions::new()).await.unwrap();

    assert!(first.is_revoked());
    assert!(session.store().resolve_url(&first.url()).is_none());
    assert_eq!(second.blob().unwrap().bytes().as_ref(), b"second");
    assert_eq!(session.payload(), Some(second.clone()));
    assert_eq!(session.store().live_count(), 1);

    session.cleanup();
    assert!(second.is_revoked());
    assert_eq!(session.store().live_count(), 0);
}

#[tokio::test]
async fn stop_aborts_pending_request_and_busy_is_rejected() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_secs(30)).body("late");
        })
        .await;

    let session = isolated();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let options = TransferOptions::new().on_failed({
        let kinds = kinds.clone();
        move |_, kind, _| kinds.lock().unwrap().push(kind)
    });
    let url = server.url("/slow");
    let running = tokio::spawn({
        let session = session.clone();
        async move { session.start(url, options).await }
    });

    wait_until_active(&session).await;
    let rejected = session.start(server.url("/slow"), TransferOptions::new()).await;
    assert!(matches!(rejected, Err(TransferError::Busy)));
    assert!(session.is_active());

    session.stop();
    let result = running.await.unwrap();

    assert!(matches!(result, Err(TransferError::Aborted)));
    assert_eq!(*kinds.lock().unwrap(), vec![FailureKind::Aborted]);
    assert!(!session.is_active());
    assert!(session.payload().is_none());
}

#[tokio::test]
async fn unreachable_url_is_an_error() {
    let session = isolated();
    let result = session.start("not a url", TransferOptions::new()).await;
    assert_eq!(result.unwrap_err().kind(), FailureKind::Error);
    assert!(!session.is_active());
}

#[tokio::test]
async fn convenience_download_runs_in_background() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/bg");
            then.status(200).header("content-type", "text/plain").body("background");
        })
        .await;

    let (tx, mut rx) = mpsc::unbounded();
    let options = TransferOptions::new().on_success(move |_, handle, content_type| {
        let blob = handle.blob().unwrap();
        tx.unbounded_send((blob.bytes().clone(), content_type.map(str::to_owned))).unwrap();
    });

    let session = start_download_from(server.url("/bg"), options);
    let (bytes, content_type) = rx.next().await.unwrap();

    assert_eq!(bytes.as_ref(), b"background");
    assert_eq!(content_type.as_deref(), Some("text/plain"));
    session.cleanup();
    assert!(session.payload().is_none());
}

#[tokio::test]
async fn convenience_download_swallows_failures() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gone");
            then.status(410);
        })
        .await;

    let (tx, mut rx) = mpsc::unbounded();
    let options = TransferOptions::new().on_failed(move |_, kind, message| {
        tx.unbounded_send((kind, message.to_owned())).unwrap();
    });

    let session = start_download_from(server.url("/gone"), options);
    let (kind, message) = rx.next().await.unwrap();

    assert_eq!(kind, FailureKind::Error);
    assert!(message.contains("410"), "{message}");
    assert!(session.payload().is_none());
}

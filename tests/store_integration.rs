//! End-to-end behaviour of a store on a real directory

use bytes::Bytes;
use filestorage::{Download, Header, Payload, StorageError, StorageEvent, Store, HEADER_SIZE};
use http_body_util::BodyExt;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::StatusCode;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

async fn open_store() -> (Store, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path()).await.unwrap();
    (store, temp_dir)
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn body_bytes(response: hyper::Response<filestorage::BoxBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn journal_text(root: &Path, shard: &str) -> String {
    std::fs::read_to_string(root.join(shard).join("config")).unwrap_or_default()
}

#[tokio::test]
async fn test_sequential_ids_and_catalog() {
    let (store, temp) = open_store().await;

    for expected in 1..=5u64 {
        let stored = store
            .insert("note.txt", Payload::from(format!("record {}", expected).into_bytes()), None)
            .await
            .unwrap();
        assert_eq!(stored.id, expected);
    }

    let catalog = store.catalog();
    assert_eq!(catalog.last_id, 5);
    assert_eq!(catalog.count, 5);

    let persisted = std::fs::read_to_string(temp.path().join("config")).unwrap();
    assert_eq!(persisted, r#"{"lastId":5,"count":5}"#);
}

#[tokio::test]
async fn test_records_land_in_their_shard() {
    let (store, temp) = open_store().await;
    store.insert("a.bin", Payload::from(vec![1u8, 2, 3]), None).await.unwrap();

    let path = temp.path().join("0000000001").join("0000000001.data");
    assert!(path.exists());
    assert_eq!(store.record_path(1), path);
    assert_eq!(
        store.record_path(1001),
        temp.path().join("0000000002").join("0000001001.data")
    );
}

#[tokio::test]
async fn test_round_trip_and_header_region() {
    let (store, _temp) = open_store().await;
    let payload = sample(5000);

    let custom = serde_json::json!({ "owner": "alice" });
    let stored = store
        .insert("blob.bin", Payload::from(payload.clone()), Some(custom.clone()))
        .await
        .unwrap();

    let raw = std::fs::read(store.record_path(stored.id)).unwrap();
    assert_eq!(raw.len(), HEADER_SIZE + payload.len());
    assert_eq!(&raw[HEADER_SIZE..], &payload[..]);

    let region = std::str::from_utf8(&raw[..HEADER_SIZE]).unwrap();
    let header: Header = serde_json::from_str(region.trim_end()).unwrap();
    assert_eq!(header.name, "blob.bin");
    assert_eq!(header.content_type, "application/octet-stream");
    assert_eq!(header.length, 5000);
    assert_eq!(header.custom, custom);

    let stat = store.stat(stored.id).await.unwrap();
    assert_eq!(stat, stored.header);

    let mut sink = Vec::new();
    let copied = store.pipe_to(stored.id, &mut sink).await.unwrap();
    assert_eq!(copied, 5000);
    assert_eq!(sink, payload);
}

#[tokio::test]
async fn test_base64_text_is_decoded() {
    let (store, _temp) = open_store().await;
    let stored = store
        .insert("hello.txt", Payload::from("aGVsbG8gd29ybGQ="), None)
        .await
        .unwrap();
    assert_eq!(stored.header.length, 11);

    let mut sink = Vec::new();
    store.pipe_to(stored.id, &mut sink).await.unwrap();
    assert_eq!(sink, b"hello world");
}

#[tokio::test]
async fn test_file_path_payload_is_streamed() {
    let (store, temp) = open_store().await;
    let source = temp.path().join("source.dat");
    std::fs::write(&source, sample(200_000)).unwrap();

    let stored = store
        .insert("source.dat", Payload::from(source.clone()), None)
        .await
        .unwrap();
    assert_eq!(stored.header.length, 200_000);

    let missing = store
        .insert("gone.dat", Payload::Path(temp.path().join("gone.dat")), None)
        .await;
    assert!(matches!(missing, Err(StorageError::MalformedInput(_))));
    assert_eq!(store.catalog().count, 1);
}

#[tokio::test]
async fn test_remove_missing_leaves_count() {
    let (store, _temp) = open_store().await;
    store.insert("a.txt", Payload::from(vec![0u8; 3]), None).await.unwrap();
    store.insert("b.txt", Payload::from(vec![0u8; 3]), None).await.unwrap();
    let before = store.catalog().count;

    let err = store.remove(42).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.catalog().count, before);
}

#[tokio::test]
async fn test_count_tracks_inserts_minus_removes() {
    let (store, _temp) = open_store().await;
    for _ in 0..6 {
        store.insert("x.bin", Payload::from(vec![7u8; 10]), None).await.unwrap();
    }
    store.remove(2).await.unwrap();
    store.remove(5).await.unwrap();
    store.remove(5).await.unwrap_err();

    let catalog = store.catalog();
    assert_eq!(catalog.count, 4);
    assert_eq!(catalog.last_id, 6);

    let ids: Vec<u64> = store.entries().await.unwrap().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec![1, 3, 4, 6]);
}

#[tokio::test]
async fn test_journal_follows_mutations() {
    let (store, temp) = open_store().await;
    store.insert("a.txt", Payload::from(vec![b'a']), None).await.unwrap();
    store.insert("b.txt", Payload::from(vec![b'b']), None).await.unwrap();

    let journal = journal_text(temp.path(), "0000000001");
    assert_eq!(journal.lines().count(), 2);
    assert!(journal.starts_with("1={\"name\":\"a.txt\""));

    store
        .update(1, "renamed.txt", Payload::from(vec![b'z'; 4]), None)
        .await
        .unwrap();
    let journal = journal_text(temp.path(), "0000000001");
    let first = journal.lines().next().unwrap();
    assert!(first.starts_with("1={\"name\":\"renamed.txt\""));
    assert_eq!(journal.lines().filter(|l| l.starts_with("1=")).count(), 1);
    assert_eq!(store.catalog().count, 2);

    store.remove(1).await.unwrap();
    let journal = journal_text(temp.path(), "0000000001");
    assert!(!journal.lines().any(|l| l.starts_with("1=")));
    assert!(journal.lines().any(|l| l.starts_with("2=")));
}

#[tokio::test]
async fn test_catalog_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let store = Store::open(temp.path()).await.unwrap();
        store.insert("a.txt", Payload::from(vec![1u8]), None).await.unwrap();
        store.insert("b.txt", Payload::from(vec![2u8]), None).await.unwrap();
        store.remove(1).await.unwrap();
    }

    let store = Store::open(temp.path()).await.unwrap();
    let catalog = store.catalog();
    assert_eq!(catalog.last_id, 2);
    assert_eq!(catalog.count, 1);

    let stored = store.insert("c.txt", Payload::from(vec![3u8]), None).await.unwrap();
    assert_eq!(stored.id, 3);
}

#[tokio::test]
async fn test_legacy_catalog_key() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("config"), r#"{"index":7,"count":3}"#).unwrap();

    let store = Store::open(temp.path()).await.unwrap();
    let stored = store.insert("a.txt", Payload::from(vec![1u8]), None).await.unwrap();
    assert_eq!(stored.id, 8);
    assert_eq!(store.catalog().count, 4);
}

#[tokio::test]
async fn test_pipe_range_request() {
    let (store, _temp) = open_store().await;
    let payload = sample(1000);
    let stored = store.insert("data.bin", Payload::from(payload.clone()), None).await.unwrap();

    let mut request = HeaderMap::new();
    request.insert(header::RANGE, HeaderValue::from_static("bytes=100-199"));

    let response = store.pipe(stored.id, Some(&request), None).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-199/1000");
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(body_bytes(response).await, &payload[100..200]);
}

#[tokio::test]
async fn test_pipe_full_response_headers() {
    let (store, _temp) = open_store().await;
    let stored = store.insert("notes.txt", Payload::from(vec![b'x'; 10]), None).await.unwrap();

    let response = store.pipe(stored.id, None, Some(Download::Original)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    assert_eq!(headers[header::CONTENT_LENGTH], "10");
    assert_eq!(
        headers[header::ETAG].to_str().unwrap(),
        format!("\"{}\"", stored.header.stamp)
    );
    assert_eq!(headers[header::CACHE_CONTROL], "public");
    assert!(headers.contains_key(header::LAST_MODIFIED));
    assert!(headers.contains_key(header::EXPIRES));
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"notes.txt\""
    );
    assert_eq!(body_bytes(response).await.len(), 10);
}

#[tokio::test]
async fn test_pipe_not_modified_wins_over_range() {
    let (store, _temp) = open_store().await;
    let stored = store.insert("data.bin", Payload::from(sample(1000)), None).await.unwrap();

    let mut request = HeaderMap::new();
    request.insert(header::RANGE, HeaderValue::from_static("bytes=0-9"));
    request.insert(
        header::IF_NONE_MATCH,
        HeaderValue::from_str(&stored.header.stamp.to_string()).unwrap(),
    );

    let response = store.pipe(stored.id, Some(&request), None).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(!response.headers().contains_key(header::CONTENT_RANGE));
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_pipe_missing_record() {
    let (store, _temp) = open_store().await;
    let response = store.pipe(99, None, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(response).await, "File not found.");
}

#[tokio::test]
async fn test_events_published() {
    let (store, _temp) = open_store().await;
    let mut events = store.subscribe();

    store.insert("a.txt", Payload::from(vec![1u8]), None).await.unwrap();
    store.read(1).await.unwrap();
    store.remove(1).await.unwrap();

    let names: Vec<&str> = (0..3).map(|_| events.try_recv().unwrap().name()).collect();
    assert_eq!(names, vec!["insert", "read", "remove"]);
}

#[tokio::test]
async fn test_concurrent_inserts_share_a_shard() {
    let (store, temp) = open_store().await;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for i in 0..20u8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.insert("c.bin", Payload::from(vec![i; 64]), None).await.unwrap().id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=20).collect::<Vec<u64>>());

    let journal = journal_text(temp.path(), "0000000001");
    assert_eq!(journal.lines().count(), 20);
    assert_eq!(store.catalog().count, 20);
}

#[tokio::test]
async fn test_overlapping_updates_keep_record_whole() {
    use tokio::io::AsyncWriteExt;
    use tokio::time::{sleep, Duration};

    let (store, temp) = open_store().await;
    let store = Arc::new(store);
    store.insert("seed.bin", Payload::from(vec![b'S'; 10]), None).await.unwrap();

    // Slow writer: half its payload now, the rest once released
    let (mut feed, reader) = tokio::io::duplex(1024);
    feed.write_all(&[b'A'; 100]).await.unwrap();

    let slow_store = store.clone();
    let slow = tokio::spawn(async move {
        slow_store
            .update(1, "slow.bin", Payload::Reader(Box::new(reader)), None)
            .await
    });

    let temp_file = temp.path().join("0000000001").join("0000000001.tmp");
    while !temp_file.exists() {
        sleep(Duration::from_millis(5)).await;
    }

    let fast_store = store.clone();
    let fast = tokio::spawn(async move {
        fast_store
            .update(1, "fast.bin", Payload::from(vec![b'B'; 50]), None)
            .await
    });
    sleep(Duration::from_millis(50)).await;

    feed.write_all(&[b'A'; 100]).await.unwrap();
    drop(feed);

    let slow = slow.await.unwrap().unwrap();
    let fast = fast.await.unwrap().unwrap();
    assert_eq!(slow.header.length, 200);
    assert_eq!(fast.header.length, 50);

    let header = store.stat(1).await.unwrap();
    let mut payload = Vec::new();
    store.pipe_to(1, &mut payload).await.unwrap();
    assert_eq!(payload.len() as u64, header.length);

    let expected = match header.name.as_str() {
        "slow.bin" => vec![b'A'; 200],
        "fast.bin" => vec![b'B'; 50],
        other => panic!("unexpected record {}", other),
    };
    assert_eq!(payload, expected);
    assert!(!temp_file.exists());

    let entries = store.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, header);
    assert_eq!(store.catalog().count, 1);
}

#[tokio::test]
async fn test_send_posts_multipart() {
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let sink = received.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let service = service_fn(move |req: Request<Incoming>| {
            let sink = sink.clone();
            async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                sink.lock().await.extend_from_slice(&body);
                Ok::<_, Infallible>(Response::new(http_body_util::Full::new(Bytes::from(
                    "accepted",
                ))))
            }
        });
        http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
            .ok();
    });

    let (store, _temp) = open_store().await;
    let stored = store
        .insert("report.txt", Payload::from(b"quarterly numbers".to_vec()), None)
        .await
        .unwrap();
    let mut events = store.subscribe();

    let reply = store
        .send(stored.id, &format!("http://{}/upload", addr), None)
        .await
        .unwrap();
    assert_eq!(reply, "accepted");

    let body = String::from_utf8_lossy(&received.lock().await).to_string();
    assert!(body.contains("name=\"File\""));
    assert!(body.contains("filename=\"report.txt\""));
    assert!(body.contains("quarterly numbers"));

    match events.try_recv().unwrap() {
        StorageEvent::Send { id, url, .. } => {
            assert_eq!(id, stored.id);
            assert!(url.ends_with("/upload"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

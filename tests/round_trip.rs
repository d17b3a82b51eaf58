use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wraith::{Client, CookieStore, Error, HttpVersion, LogEvent, LogKind, RetryPolicy};

mod helpers;
use helpers::mock_server::MockHttpServer;

fn client(retries: usize) -> Client {
    Client::builder()
        .http_version(HttpVersion::Http1_1)
        .max_retries(retries)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_replayable_body_is_retried() {
    helpers::init_tracing();
    let server = MockHttpServer::new().await.unwrap();
    let url = format!("{}/reset-once", server.url());
    let requests = server.requests();
    let _server = server.start();

    let resp = client(1)
        .post(&url)
        .body("replay me")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "replay me");

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.body == b"replay me"));
}

#[tokio::test]
async fn test_seekable_stream_is_rewound() {
    let server = MockHttpServer::new().await.unwrap();
    let url = format!("{}/reset-once", server.url());
    let _server = server.start();

    let resp = client(1)
        .put(&url)
        .body_seekable(Cursor::new(b"seekable".to_vec()), Some(8))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "seekable");
}

#[tokio::test]
async fn test_consumed_stream_is_not_retried() {
    let server = MockHttpServer::new().await.unwrap();
    let url = format!("{}/reset-once", server.url());
    let requests = server.requests();
    let _server = server.start();

    let err = client(3)
        .put(&url)
        .body_stream(Cursor::new(b"one shot".to_vec()), None)
        .send()
        .await
        .unwrap_err();
    assert!(!err.is_timeout(), "unexpected error: {err}");

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1, "a drained stream must not be resent");
    assert_eq!(requests[0].body, b"one shot");
}

#[tokio::test]
async fn test_idempotent_policy_skips_post() {
    let server = MockHttpServer::new().await.unwrap();
    let url = format!("{}/reset-once", server.url());
    let requests = server.requests();
    let _server = server.start();

    let client = Client::builder()
        .http_version(HttpVersion::Http1_1)
        .retry_policy(RetryPolicy::Idempotent)
        .build()
        .unwrap();
    assert!(client.post(&url).body("x").send().await.is_err());
    assert_eq!(requests.lock().unwrap().len(), 1);

    // The server only resets once; a GET now goes through.
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_preflight_can_short_circuit() {
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url();
    let tracker = server.tracker();
    let _server = server.start();

    let client = Client::builder()
        .http_version(HttpVersion::Http1_1)
        .preflight(|req| {
            if req.url().path() == "/blocked" {
                return Err(Error::UseLastResponse);
            }
            req.headers_mut().push(("X-Trace".into(), "1".into()));
            Ok(())
        })
        .build()
        .unwrap();

    let err = client
        .get(format!("{}/blocked", url))
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UseLastResponse));
    assert_eq!(tracker.count(), 0);

    let requests = {
        let server = MockHttpServer::new().await.unwrap();
        let url = server.url();
        let requests = server.requests();
        let _server = server.start();
        client.get(&url).send().await.unwrap().bytes().await.unwrap();
        requests
    };
    assert_eq!(requests.lock().unwrap()[0].header("x-trace"), Some("1"));
}

#[tokio::test]
async fn test_postflight_error_replaces_response() {
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url();
    let _server = server.start();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let client = Client::builder()
        .http_version(HttpVersion::Http1_1)
        .postflight(move |resp| {
            counter.fetch_add(1, Ordering::SeqCst);
            if resp.header("content-length") == Some("5") {
                return Err(Error::Callback("rejected".into()));
            }
            Ok(())
        })
        .build()
        .unwrap();

    let err = client.get(&url).send().await.unwrap_err();
    assert!(matches!(err, Error::Callback(_)));
    assert_eq!(seen.load(Ordering::SeqCst), 1, "callback errors are not retried");
}

#[derive(Default)]
struct Jar {
    stored: Mutex<Vec<String>>,
}

impl CookieStore for Jar {
    fn cookies(&self, _url: &url::Url) -> Option<String> {
        let stored = self.stored.lock().unwrap();
        if stored.is_empty() {
            return None;
        }
        Some(
            stored
                .iter()
                .filter_map(|c| c.split(';').next())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn set_cookies(&self, _url: &url::Url, set_cookie: &[&str]) {
        self.stored
            .lock()
            .unwrap()
            .extend(set_cookie.iter().map(|c| c.to_string()));
    }
}

#[tokio::test]
async fn test_cookie_store_round_trip() {
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url();
    let requests = server.requests();
    let _server = server.start();

    let jar = Arc::new(Jar::default());
    let client = Client::builder()
        .http_version(HttpVersion::Http1_1)
        .cookie_store(jar.clone())
        .build()
        .unwrap();

    client.get(format!("{}/cookie", url)).send().await.unwrap().bytes().await.unwrap();
    client.get(&url).send().await.unwrap().bytes().await.unwrap();

    let requests = requests.lock().unwrap();
    assert_eq!(requests[0].header("cookie"), None);
    assert_eq!(requests[1].header("cookie"), Some("session=abc"));
}

#[tokio::test]
async fn test_logger_sees_connection_events() {
    let server = MockHttpServer::new().await.unwrap();
    let url = server.url();
    let _server = server.start();

    let events: Arc<Mutex<Vec<LogEvent>>> = Arc::default();
    let sink = events.clone();
    let client = Client::builder()
        .http_version(HttpVersion::Http1_1)
        .logger(Arc::new(move |event: LogEvent| sink.lock().unwrap().push(event)))
        .build()
        .unwrap();

    let resp = client.get(&url).log_id("req-1").send().await.unwrap();
    resp.bytes().await.unwrap();

    let events = events.lock().unwrap();
    let kinds: Vec<LogKind> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&LogKind::TcpConnect));
    let header = kinds.iter().position(|k| *k == LogKind::ResponseHeader).unwrap();
    let body = kinds.iter().position(|k| *k == LogKind::ResponseBody).unwrap();
    assert!(header < body);
    assert!(events.iter().all(|e| e.id == "req-1"));
}

//! packstore HTTP server
//!
//! Serves objects stored as standalone files or packed into per-directory
//! archives, and runs the background compaction scheduler.

pub mod delete;
pub mod get;
pub mod http;
pub mod listing;
pub mod metrics;
pub mod metrics_middleware;
pub mod put;
pub mod state;
pub mod target;
pub mod vhost;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::get as route_get,
};
use serde_json::json;
use state::AppState;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Object API router
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit =
        DefaultBodyLimit::max(usize::try_from(state.max_body_size).unwrap_or(usize::MAX));

    Router::new()
        .route(
            "/",
            route_get(get::get_root)
                .head(get::get_root)
                .options(get::get_root),
        )
        .route(
            "/{*path}",
            route_get(get::get_object)
                .head(get::get_object)
                .options(get::get_object)
                .put(put::put_object)
                .delete(delete::delete_object),
        )
        .layer(body_limit)
        .layer(middleware::from_fn(metrics_middleware::metrics_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the metrics listener
pub fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", route_get(metrics_handler))
        .route("/health", route_get(health_check))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::server_metrics().export_prometheus(),
    )
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, Request};
    use http_body_util::BodyExt;
    use packstore_archive::{
        Archive, ArchiveStore, CompactionCoordinator, CompactionScheduler, LockPolicy, OpenPolicy,
        PathLocks, RedbCoordinator, StoreResult,
    };
    use packstore_common::VhostConfig;
    use packstore_common::config::CompactionConfig;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    const HOST: &str = "files.example";

    struct TestServer {
        _dir: tempfile::TempDir,
        root: PathBuf,
        state: Arc<AppState>,
        router: Router,
    }

    struct Reply {
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    impl TestServer {
        fn new() -> Self {
            Self::with_vhost(|_| {})
        }

        fn with_vhost(tweak: impl FnOnce(&mut VhostConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("www");
            std::fs::create_dir(&root).unwrap();

            let mut vhost = VhostConfig {
                name: "test".into(),
                hosts: vec![HOST.into()],
                root: root.clone(),
                file_mode: 0o644,
                dir_mode: 0o755,
                ..VhostConfig::default()
            };
            tweak(&mut vhost);

            let coordinator = RedbCoordinator::open(dir.path().join("compaction.redb")).unwrap();
            let locks = PathLocks::new(LockPolicy::default());
            let store = Arc::new(ArchiveStore::new(
                locks,
                Arc::new(coordinator),
                "h1",
                OpenPolicy::default(),
            ));
            let state = Arc::new(AppState::new(
                vhost::Vhosts::new(&[vhost]),
                store,
                1024 * 1024,
            ));
            let router = build_router(Arc::clone(&state));

            Self {
                _dir: dir,
                root,
                state,
                router,
            }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.root.join(rel)
        }

        async fn send(&self, method: Method, uri: &str, headers: &[(&str, &str)], body: &[u8]) -> Reply {
            let mut request = Request::builder()
                .method(method.clone())
                .uri(uri)
                .header(header::HOST, HOST);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            if method == Method::PUT && !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
                request = request.header(header::CONTENT_LENGTH, body.len());
            }
            let request = request.body(Body::from(body.to_vec())).unwrap();

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
            Reply {
                status,
                headers,
                body,
            }
        }

        async fn put_archived(&self, uri: &str, body: &[u8]) -> Reply {
            self.send(Method::PUT, uri, &[("Archive", "1")], body).await
        }

        async fn get(&self, uri: &str) -> Reply {
            self.send(Method::GET, uri, &[], b"").await
        }
    }

    /// Inspect an archive through the store, which may hold it open
    fn inspect<T>(server: &TestServer, path: &Path, f: impl FnOnce(&mut Archive) -> StoreResult<T>) -> T {
        server.state.store.with_archive(path, f).unwrap()
    }

    #[tokio::test]
    async fn test_archived_put_then_get() {
        let server = TestServer::new();
        let reply = server.put_archived("/a/b/c.txt", b"hello").await;
        assert_eq!(reply.status, StatusCode::OK);

        let archive_path = server.path("a/b/b.bolt");
        assert!(archive_path.exists());
        assert!(!server.path("a/b/c.txt").exists());
        let bucket = inspect(&server, &archive_path, |archive| archive.lookup("c.txt"));
        assert_eq!(bucket.as_deref(), Some("wzd1"));

        let reply = server.get("/a/b/c.txt").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, b"hello");
        assert_eq!(reply.headers[header::CONTENT_LENGTH], "5");
        assert_eq!(reply.headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(reply.headers[header::ACCEPT_RANGES], "bytes");
    }

    #[tokio::test]
    async fn test_overwrite_compacted_by_scheduler() {
        let server = TestServer::new();
        server.put_archived("/a/b/c.txt", b"hello").await;
        let reply = server.put_archived("/a/b/c.txt", b"bye").await;
        assert_eq!(reply.status, StatusCode::OK);

        let archive_path = server.path("a/b/b.bolt");
        let task_path = archive_path.to_string_lossy().into_owned();
        let store = Arc::clone(&server.state.store);
        let task = store.coordinator().get(&task_path).unwrap().unwrap();
        assert_eq!(task.owner, "h1");
        let bucket = inspect(&server, &archive_path, |archive| archive.lookup("c.txt"));
        assert_eq!(bucket.as_deref(), Some("wzd1"));

        let config = CompactionConfig {
            min_age_secs: 60,
            workers: 2,
            ..CompactionConfig::default()
        };
        let scheduler = CompactionScheduler::new(Arc::clone(&store), &config);
        let (_tx, rx) = tokio::sync::watch::channel(false);

        let early = scheduler.run_pass(task.dirty_since + 10, &rx).await.unwrap();
        assert_eq!(early.due, 0);
        let report = scheduler.run_pass(task.dirty_since + 60, &rx).await.unwrap();
        assert_eq!(report.compacted, 1);
        assert!(store.coordinator().get(&task_path).unwrap().is_none());

        let reply = server.get("/a/b/c.txt").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, b"bye");
    }

    #[tokio::test]
    async fn test_delete_last_key_removes_archive() {
        let server = TestServer::new();
        server.put_archived("/a/b/c.txt", b"hello").await;

        let reply = server
            .send(Method::DELETE, "/a/b/c.txt", &[("FromArchive", "1")], b"")
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(!server.path("a/b/b.bolt").exists());

        assert_eq!(server.get("/a/b/c.txt").await.status, StatusCode::NOT_FOUND);
        let reply = server
            .send(Method::DELETE, "/a/b/c.txt", &[("FromArchive", "1")], b"")
            .await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_length_mismatch_leaves_nothing() {
        let server = TestServer::new();
        let reply = server
            .send(Method::PUT, "/a/short.bin", &[("Content-Length", "5")], b"0123456789")
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert!(!server.path("a").exists());

        std::fs::create_dir(server.path("keep")).unwrap();
        let reply = server
            .send(Method::PUT, "/keep/x/y/short.bin", &[("Content-Length", "5")], b"0123456789")
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert!(server.path("keep").is_dir());
        assert!(!server.path("keep/x").exists());

        let reply = server
            .send(
                Method::PUT,
                "/a/short.bin",
                &[("Content-Length", "5"), ("Archive", "1")],
                b"0123456789",
            )
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert!(!server.path("a/a.bolt").exists());
    }

    #[tokio::test]
    async fn test_range_requests() {
        let server = TestServer::new();
        let payload = b"0123456789";
        server.put_archived("/r/packed.bin", payload).await;
        server.send(Method::PUT, "/r/plain.bin", &[], payload).await;
        assert!(server.path("r/plain.bin").exists());

        for uri in ["/r/packed.bin", "/r/plain.bin"] {
            let reply = server.send(Method::GET, uri, &[("Range", "bytes=2-4")], b"").await;
            assert_eq!(reply.status, StatusCode::PARTIAL_CONTENT, "{uri}");
            assert_eq!(reply.headers[header::CONTENT_RANGE], "bytes 2-4/10");
            assert_eq!(reply.headers[header::CONTENT_LENGTH], "3");
            assert_eq!(reply.body, b"234");

            let reply = server.send(Method::GET, uri, &[("Range", "bytes=20-")], b"").await;
            assert_eq!(reply.status, StatusCode::RANGE_NOT_SATISFIABLE, "{uri}");
            assert_eq!(reply.headers[header::CONTENT_RANGE], "bytes */10");
        }
    }

    #[tokio::test]
    async fn test_concurrent_puts_into_new_archive() {
        let server = Arc::new(TestServer::new());
        let first = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.put_archived("/d/e/one.txt", b"one").await.status })
        };
        let second = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.put_archived("/d/e/two.txt", b"two").await.status })
        };
        assert_eq!(first.await.unwrap(), StatusCode::OK);
        assert_eq!(second.await.unwrap(), StatusCode::OK);

        assert_eq!(server.get("/d/e/one.txt").await.body, b"one");
        assert_eq!(server.get("/d/e/two.txt").await.body, b"two");

        let (count, counter, buckets) = inspect(&server, &server.path("d/e/e.bolt"), |archive| {
            Ok((archive.count()?, archive.bucket_counter()?, archive.buckets()?))
        });
        assert_eq!(count, 2);
        assert_eq!(counter, 1);
        assert_eq!(buckets, vec!["wzd1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sixteen_concurrent_puts_succeed() {
        let server = Arc::new(TestServer::new());
        let puts: Vec<_> = (0..16)
            .map(|i| {
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let uri = format!("/q/k{i}.txt");
                    server.put_archived(&uri, uri.as_bytes()).await.status
                })
            })
            .collect();
        for put in puts {
            assert_eq!(put.await.unwrap(), StatusCode::OK);
        }

        let count = inspect(&server, &server.path("q/q.bolt"), |archive| archive.count());
        assert_eq!(count, 16);
        assert_eq!(server.get("/q/k7.txt").await.body, b"/q/k7.txt");
    }

    #[tokio::test]
    async fn test_standalone_put_get_delete() {
        let server = TestServer::with_vhost(|v| v.prune_dirs = true);
        let reply = server.send(Method::PUT, "/s/t/page.html", &[], b"<p>hi</p>").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(server.path("s/t/page.html").exists());

        let reply = server.get("/s/t/page.html").await;
        assert_eq!(reply.body, b"<p>hi</p>");
        assert_eq!(reply.headers[header::CONTENT_TYPE], "text/html; charset=utf-8");
        let etag = reply.headers[header::ETAG].to_str().unwrap().to_string();

        let reply = server
            .send(Method::GET, "/s/t/page.html", &[("If-None-Match", &etag)], b"")
            .await;
        assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
        assert!(reply.body.is_empty());

        let reply = server.send(Method::HEAD, "/s/t/page.html", &[], b"").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers[header::CONTENT_LENGTH], "9");
        assert!(reply.body.is_empty());

        let reply = server.send(Method::DELETE, "/s/t/page.html", &[], b"").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(!server.path("s/t").exists());
        assert!(server.path("s").exists());
    }

    #[tokio::test]
    async fn test_options_lists_allowed_methods() {
        let server = TestServer::with_vhost(|v| v.delete = false);
        server.put_archived("/o/x.txt", b"x").await;
        let reply = server.send(Method::OPTIONS, "/o/x.txt", &[], b"").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers[header::ALLOW], "GET, HEAD, OPTIONS, PUT");

        let reply = server.send(Method::DELETE, "/o/x.txt", &[], b"").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_put_validation() {
        let server = TestServer::with_vhost(|v| {
            v.allowed_content_types = vec!["text/plain".into()];
        });
        let reply = server
            .send(Method::PUT, "/v/x.bin", &[("Content-Type", "application/x-sh")], b"x")
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);

        let reply = server
            .send(Method::PUT, "/v/v.bolt", &[("Content-Type", "text/plain")], b"x")
            .await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);

        let reply = server
            .send(Method::PUT, "/v/empty.txt", &[("Content-Type", "text/plain")], b"")
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);

        let closed = TestServer::with_vhost(|v| v.upload = false);
        let reply = closed.send(Method::PUT, "/v/x.txt", &[], b"x").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_host_and_traversal() {
        let server = TestServer::new();
        let request = Request::builder()
            .uri("/a.txt")
            .header(header::HOST, "other.example")
            .body(Body::empty())
            .unwrap();
        let response = server.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(server.get("/a/../../etc/passwd").await.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_archive_file_hidden() {
        let server = TestServer::new();
        server.put_archived("/h/k.txt", b"k").await;
        assert!(server.path("h/h.bolt").exists());
        assert_eq!(server.get("/h/h.bolt").await.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_archived_content_type_ignores_range_bytes() {
        let server = TestServer::new();
        server.put_archived("/t/blob", b"\x89PNG\r\n\x1a\nHELLO").await;

        let reply = server.get("/t/blob").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers[header::CONTENT_TYPE], "image/png");

        let reply = server.send(Method::GET, "/t/blob", &[("Range", "bytes=8-11")], b"").await;
        assert_eq!(reply.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(reply.body, b"HELL");
        assert_eq!(reply.headers[header::CONTENT_TYPE], "application/octet-stream");

        let reply = server.send(Method::HEAD, "/t/blob", &[], b"").await;
        assert_eq!(reply.headers[header::CONTENT_TYPE], "application/octet-stream");

        server.put_archived("/t/page.html", b"0123456789").await;
        let reply = server.send(Method::GET, "/t/page.html", &[("Range", "bytes=0-3")], b"").await;
        assert_eq!(reply.headers[header::CONTENT_TYPE], "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_unique_keys_conflict() {
        let server = TestServer::with_vhost(|v| v.unique_keys = true);
        server.put_archived("/u/k.txt", b"packed").await;
        let reply = server.send(Method::PUT, "/u/k.txt", &[], b"plain").await;
        assert_eq!(reply.status, StatusCode::CONFLICT);

        server.send(Method::PUT, "/u/f.txt", &[], b"plain").await;
        let reply = server.put_archived("/u/f.txt", b"packed").await;
        assert_eq!(reply.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_file_shadows_archive_until_forced() {
        let server = TestServer::new();
        server.put_archived("/m/k.txt", b"packed").await;
        server.send(Method::PUT, "/m/k.txt", &[], b"plain").await;

        assert_eq!(server.get("/m/k.txt").await.body, b"plain");
        let reply = server
            .send(Method::GET, "/m/k.txt", &[("FromArchive", "1")], b"")
            .await;
        assert_eq!(reply.body, b"packed");

        // Plain DELETE removes the file first, then the archived key
        server.send(Method::DELETE, "/m/k.txt", &[], b"").await;
        assert_eq!(server.get("/m/k.txt").await.body, b"packed");
        server.send(Method::DELETE, "/m/k.txt", &[], b"").await;
        assert_eq!(server.get("/m/k.txt").await.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_listing() {
        let server = TestServer::new();
        server.put_archived("/l/b.txt", b"b").await;
        server.put_archived("/l/a.txt", b"a").await;
        server.send(Method::PUT, "/l/a.txt", &[], b"a").await;
        server.send(Method::PUT, "/l/c.txt", &[], b"c").await;

        let reply = server.send(Method::GET, "/l/", &[("Keys", "all")], b"").await;
        assert_eq!(reply.status, StatusCode::OK);
        let names: Vec<String> = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(names, ["a.txt", "a.txt", "b.txt", "c.txt"]);

        let reply = server
            .send(Method::GET, "/l/", &[("Keys", "all"), ("Unique", "1")], b"")
            .await;
        let names: Vec<String> = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);

        let reply = server
            .send(Method::GET, "/l/", &[("KeysCount", "archive")], b"")
            .await;
        let count: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(count["count"], 2);

        let reply = server.send(Method::GET, "/l", &[("Keys", "files")], b"").await;
        let names: Vec<String> = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(names, ["a.txt", "c.txt"]);

        let reply = server.send(Method::GET, "/nope/", &[("Keys", "all")], b"").await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(server.get("/l/").await.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_router() {
        let server = TestServer::new();
        server.get("/missing.txt").await;

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = metrics_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("packstore_requests_total{operation=\"get\",status=\"client_error\"}"));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = metrics_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use bytes::Bytes;
use wbx_abi::{DynSandbox, ExecRequest};
use wbx_cbor::Digest;
use wbx_host::mock::ScriptedTool;
use wbx_host::{EnvConfig, Environment, FetchConfig, HttpFetcher};
use wbx_store::MemStore;
use wbx_vfs::mock::{brotli_compress, tar_pack};
use wbx_vfs::{FetchError, Fetcher};

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn static_route(router: Router, path: &str, body: Vec<u8>) -> Router {
    let body = Bytes::from(body);
    router.route(path, get(move || {
        let body = body.clone();
        async move { body }
    }))
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(&FetchConfig { timeout_ms: 5_000 }).unwrap()
}

#[tokio::test]
async fn fetches_full_body() {
    let router = static_route(Router::new(), "/lazy_cache/abc.a", b"archive".to_vec())
        .route("/not-modified", get(|| async { StatusCode::NOT_MODIFIED }));
    let base = serve(router).await;
    let fetcher = fetcher();

    let body = fetcher.fetch(&format!("{base}/lazy_cache/abc.a")).await.unwrap();
    assert_eq!(body, "archive");
    let body = fetcher.fetch(&format!("{base}/not-modified")).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn error_status_is_fetch_error() {
    let router = Router::new().route(
        "/broken",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let base = serve(router).await;
    let fetcher = fetcher();

    let err = fetcher.fetch(&format!("{base}/missing")).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 404, .. }), "{err}");
    let err = fetcher.fetch(&format!("{base}/broken")).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 500, .. }), "{err}");
}

#[tokio::test]
async fn unreachable_host_is_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = fetcher()
        .fetch(&format!("http://{addr}/index.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport { .. }), "{err}");
}

#[tokio::test]
async fn environment_starts_over_http() {
    let pack = brotli_compress(&tar_pack(&[("bin/echo", b"shell;echo", 0o755)]));
    let index = format!(
        r#"{{"root_pack": {{"path": "/root.pack.br", "size": {}, "digest": "{}"}}}}"#,
        pack.len(),
        Digest::sha256_of(&pack)
    );
    let router = static_route(Router::new(), "/static_lib/index.json", index.into_bytes());
    let router = static_route(router, "/static_lib/root_pack/root.pack.br", pack);
    let base = format!("{}/static_lib", serve(router).await);

    let fetcher = Arc::new(fetcher());
    let index = Environment::fetch_index(fetcher.as_ref(), &base).await.unwrap();
    let config = EnvConfig {
        base_url: base,
        ..EnvConfig::default()
    };
    let env = Environment::start_with(
        config,
        &index,
        Arc::new(MemStore::new()),
        fetcher,
        |_vfs| {
            let shell: DynSandbox = Arc::new(ScriptedTool::echo("shell"));
            vec![("shell".to_string(), shell)]
        },
    )
    .await
    .unwrap();

    let result = env
        .exec(ExecRequest::new(["/bin/echo", "over", "http"]))
        .await
        .unwrap();
    assert_eq!(result.stdout, "echo /bin/echo over http\n");
}

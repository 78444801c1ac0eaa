use std::net::SocketAddr;

use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use wafsync_adapters::{
    CollectionStatus, ConditionalFetch, DocumentSource, ListingRules, OsimClient, RemoteDirectory,
    RemoteError, StatusLookup, WafClient,
};
use wafsync_core::ErrorKind;
use wafsync_storage::{HttpClientConfig, HttpFetcher};

const ETAG_V1: &str = "\"v1\"";

struct TestServer {
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn listing_root() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/html")],
        r#"<html><body>
            <a href="?C=M;O=A">Last modified</a>
            <a href="/">Parent Directory</a>
            <a href="sub/">sub/</a>
            <a href="doc.xml">doc.xml</a>
        </body></html>"#,
    )
}

async fn document(headers: HeaderMap) -> Response {
    let sent = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if sent == Some(ETAG_V1) {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    ([(header::ETAG, ETAG_V1)], "<gmd:MD_Metadata/>").into_response()
}

async fn lookup(Path(id): Path<String>) -> Response {
    match id.as_str() {
        "known" => (
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"meta":{"totalGranules":17}}"#,
        )
            .into_response(),
        "busy" => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        "forbidden" => StatusCode::FORBIDDEN.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_server() -> TestServer {
    let app = Router::new()
        .route("/waf/", get(listing_root))
        .route("/waf/doc.xml", get(document))
        .route("/waf/broken/", get(|| async { StatusCode::BAD_GATEWAY }))
        .route("/lookup/{id}", get(lookup));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = rx.await;
        });
        let _ = server.await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        shutdown: Some(tx),
    }
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        user_agent: Some("wafsync-test/0.1".to_string()),
        ..Default::default()
    })
    .expect("http client")
}

#[tokio::test]
async fn waf_client_lists_children_and_honours_validators() {
    let server = start_server().await;
    let client = WafClient::new(
        fetcher(),
        format!("{}/waf", server.base_url),
        ListingRules::default(),
    );
    let root = client.root_url().to_string();
    assert!(root.ends_with("/waf/"));

    let listing = client.list(&root).await.expect("listing");
    assert_eq!(listing.directories, vec![format!("{root}sub/")]);
    assert_eq!(listing.documents, vec![format!("{root}doc.xml")]);

    let doc_url = format!("{root}doc.xml");
    let first = client.fetch_conditional(&doc_url, None).await.unwrap();
    let ConditionalFetch::Modified { body, validator } = first else {
        panic!("expected content on unconditional fetch");
    };
    assert_eq!(body, b"<gmd:MD_Metadata/>".to_vec());
    assert_eq!(validator.as_deref(), Some(ETAG_V1));

    let second = client
        .fetch_conditional(&doc_url, Some(ETAG_V1))
        .await
        .unwrap();
    assert_eq!(second, ConditionalFetch::NotModified);

    let stale = client
        .fetch_conditional(&doc_url, Some("\"v0\""))
        .await
        .unwrap();
    assert!(matches!(stale, ConditionalFetch::Modified { .. }));
}

#[tokio::test]
async fn waf_client_classifies_failures() {
    let server = start_server().await;
    let client = WafClient::new(
        fetcher(),
        format!("{}/waf/", server.base_url),
        ListingRules::default(),
    );

    let broken = client
        .list(&format!("{}/waf/broken/", server.base_url))
        .await
        .unwrap_err();
    assert_eq!(broken.kind(), ErrorKind::TransientNetwork);

    let missing = client
        .fetch_conditional(&format!("{}/waf/gone.xml", server.base_url), None)
        .await
        .unwrap_err();
    assert!(matches!(missing, RemoteError::NotFound { .. }));
}

#[tokio::test]
async fn osim_client_maps_lookup_responses() {
    let server = start_server().await;
    let client = OsimClient::new(fetcher(), format!("{}/lookup/{{uuid}}", server.base_url))
        .expect("lookup client");

    assert_eq!(
        client.lookup("known").await.unwrap(),
        CollectionStatus {
            granule_count: Some(17)
        }
    );
    assert_eq!(
        client.lookup("unknown").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        client.lookup("busy").await.unwrap_err().kind(),
        ErrorKind::TransientNetwork
    );
    assert_eq!(
        client.lookup("forbidden").await.unwrap_err().kind(),
        ErrorKind::PermanentRequest
    );
}

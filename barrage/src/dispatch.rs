//! Request dispatch.
//!
//! The virtual user loop hands every synthesized [`RequestSpec`] to a
//! [`Dispatch`] implementation and records the outcome. [`Http`] is the real
//! one, a pooled hyper client that joins each request path onto the
//! configured target URI.

use std::time::Duration;

use async_trait::async_trait;
use barrage_payload::{Method, RequestSpec};
use bytes::Bytes;
use http::{
    StatusCode, Uri,
    header::CONTENT_TYPE,
    uri::{InvalidUri, InvalidUriParts, PathAndQuery},
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::Request;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

/// Errors produced by [`Dispatch`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request path and query do not form a valid URI path.
    #[error("Invalid request path: {0}")]
    Path(#[from] InvalidUri),
    /// The target and request path do not form a valid URI.
    #[error("Invalid request URI: {0}")]
    Uri(#[from] InvalidUriParts),
    /// Wrapper around [`http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),
    /// The JSON body could not be encoded.
    #[error("Body could not be encoded: {0}")]
    Body(#[from] serde_json::Error),
    /// The request could not be sent.
    #[error("Failed to send HTTP request: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The response body could not be read.
    #[error("Failed to read response body: {0}")]
    Response(#[from] hyper::Error),
    /// No complete response within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// A short, fixed label suitable for a metric.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Path(_) | Self::Uri(_) | Self::Http(_) | Self::Body(_) => "request",
            Self::Client(_) => "connection",
            Self::Response(_) => "response",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Sends a [`RequestSpec`] somewhere and reports the response status.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Send `request`, wait for the complete response and return its status.
    /// Non-success statuses are not errors.
    ///
    /// # Errors
    ///
    /// Returns an error if no response was received.
    async fn dispatch(&self, request: &RequestSpec) -> Result<StatusCode, Error>;
}

/// The HTTP dispatcher.
#[derive(Debug, Clone)]
pub struct Http {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    target: Uri,
    timeout: Duration,
}

impl Http {
    /// Create a new [`Http`] sending to `target`. At most `max_idle` idle
    /// connections are kept, typically the largest concurrency target.
    #[must_use]
    pub fn new(target: Uri, timeout: Duration, max_idle: usize) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle)
            .retry_canceled_requests(false)
            .build_http();
        Self {
            client,
            target,
            timeout,
        }
    }

    /// The full URI `request` is sent to.
    ///
    /// # Errors
    ///
    /// Returns an error if the joined path is not a valid URI.
    pub fn uri_for(&self, request: &RequestSpec) -> Result<Uri, Error> {
        let prefix = self.target.path().trim_end_matches('/');
        let path_and_query =
            PathAndQuery::try_from(format!("{prefix}{}", request.path_and_query()))?;
        let mut parts = self.target.clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        Ok(Uri::from_parts(parts)?)
    }

    async fn exchange(
        &self,
        request: Request<BoxBody<Bytes, hyper::Error>>,
    ) -> Result<StatusCode, Error> {
        let response = self.client.request(request).await?;
        let status = response.status();
        // Drain the body so the connection returns to the pool.
        response.into_body().collect().await?;
        Ok(status)
    }
}

#[async_trait]
impl Dispatch for Http {
    async fn dispatch(&self, spec: &RequestSpec) -> Result<StatusCode, Error> {
        let uri = self.uri_for(spec)?;
        let method = match spec.method {
            Method::Get => hyper::Method::GET,
            Method::Post => hyper::Method::POST,
        };

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = match &spec.body {
            Some(body) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Bytes::from(body.to_vec()?)
            }
            None => Bytes::new(),
        };
        let request = builder.body(full(body))?;

        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }
}

fn full(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use barrage_payload::{RequestKind, Workload, workload};
    use bytes::Bytes;
    use http::{StatusCode, Uri};
    use rand::{SeedableRng, rngs::SmallRng};
    use time::OffsetDateTime;
    use warp::Filter;

    use super::{Dispatch, Error, Http};

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        query: String,
        host: String,
        content_type: Option<String>,
        body: Vec<u8>,
    }

    fn serve() -> (SocketAddr, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);

        let routes = warp::any()
            .and(warp::method())
            .and(warp::path::full())
            .and(warp::query::raw().or(warp::any().map(String::new)).unify())
            .and(warp::header::headers_cloned())
            .and(warp::body::bytes())
            .map(
                move |method: warp::http::Method,
                      path: warp::path::FullPath,
                      query: String,
                      headers: warp::http::HeaderMap,
                      body: Bytes| {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string)
                    };
                    record.lock().expect("lock poisoned").push(Seen {
                        method: method.to_string(),
                        path: path.as_str().to_string(),
                        query,
                        host: header("host").unwrap_or_default(),
                        content_type: header("content-type"),
                        body: body.to_vec(),
                    });
                    let status = if path.as_str().ends_with("/fail") {
                        warp::http::StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        warp::http::StatusCode::OK
                    };
                    warp::reply::with_status("ok", status)
                },
            );

        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        (addr, seen)
    }

    fn http(target: &str) -> Http {
        Http::new(
            target.parse::<Uri>().expect("valid uri"),
            Duration::from_secs(5),
            4,
        )
    }

    fn workload() -> Workload {
        Workload::new(&workload::Config::default()).expect("valid workload")
    }

    #[test]
    fn paths_join_onto_target() {
        let mut rng = SmallRng::seed_from_u64(3);
        let request = workload().failure_request(&mut rng);

        let bare = http("http://nginx");
        assert_eq!(
            bare.uri_for(&request).expect("valid uri").to_string(),
            "http://nginx/fail"
        );
        let prefixed = http("http://localhost:8080/api/");
        assert_eq!(
            prefixed.uri_for(&request).expect("valid uri").to_string(),
            "http://localhost:8080/api/fail"
        );
    }

    #[tokio::test]
    async fn search_get_reaches_server() {
        let (addr, seen) = serve();
        let dispatcher = http(&format!("http://{addr}"));
        let workload = workload();
        let mut rng = SmallRng::seed_from_u64(11);

        // Find a GET search that carries a query so the query is on the wire.
        let request = loop {
            let request =
                workload.request(RequestKind::SearchGet, &mut rng, OffsetDateTime::now_utc());
            if !request.query.is_empty() {
                break request;
            }
        };
        let status = dispatcher.dispatch(&request).await.expect("dispatch failed");
        assert_eq!(status, StatusCode::OK);

        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].path, "/search");
        assert_eq!(format!("?{}", seen[0].query), request.query.to_string());
        assert_eq!(seen[0].host, request.headers["Host"]);
        assert!(seen[0].body.is_empty());
    }

    #[tokio::test]
    async fn transfer_posts_json() {
        let (addr, seen) = serve();
        let dispatcher = http(&format!("http://{addr}/bank"));
        let mut rng = SmallRng::seed_from_u64(5);
        let request =
            workload().request(RequestKind::Transfer, &mut rng, OffsetDateTime::now_utc());

        let status = dispatcher.dispatch(&request).await.expect("dispatch failed");
        assert_eq!(status, StatusCode::OK);

        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].path, "/bank/transfer");
        assert_eq!(seen[0].content_type.as_deref(), Some("application/json"));
        let body: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&seen[0].body).expect("body is a JSON object");
        let mut keys: Vec<&str> = body.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["amount", "fromAccount", "time", "toAccount", "trxType"]
        );
    }

    #[tokio::test]
    async fn server_errors_are_statuses() {
        let (addr, _seen) = serve();
        let dispatcher = http(&format!("http://{addr}"));
        let mut rng = SmallRng::seed_from_u64(1);
        let request = workload().failure_request(&mut rng);

        let status = dispatcher.dispatch(&request).await.expect("dispatch failed");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
            listener.local_addr().expect("no local addr")
        };
        let dispatcher = http(&format!("http://{addr}"));
        let mut rng = SmallRng::seed_from_u64(1);
        let request = workload().failure_request(&mut rng);

        let err = dispatcher
            .dispatch(&request)
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, Error::Client(_)));
        assert_eq!(err.label(), "connection");
    }
}

//! HTTP API over a store
//!
//! - `GET /health` - Catalog counters
//! - `GET /listing` - Concatenated shard journals
//! - `GET /{id}` - Serve a record (supports `Range`, `If-None-Match`)
//! - `GET /{id}?download[=name]` - Same, as an attachment
//! - `HEAD /{id}` - Headers only
//! - `POST /{name}[?custom=...]` - Insert the request body as a new record
//! - `PUT /{id}/{name}[?custom=...]` - Replace a record
//! - `DELETE /{id}` - Remove a record
//!
//! ## Example Usage
//!
//! ```bash
//! # Store a file
//! curl -X POST --data-binary @logo.png http://localhost:8095/logo.png
//!
//! # Fetch the second half of a record
//! curl -H "Range: bytes=500-" http://localhost:8095/1
//! ```

use crate::error::{Result, StorageError};
use crate::ids::parse_id;
use crate::payload::{Payload, PayloadReader};
use crate::retrieval::{full_body, not_found, BoxBody, Download};
use crate::store::{Store, Stored};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

/// HTTP server state
pub struct HttpServer {
    store: Arc<Store>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(store: Arc<Store>, bind_addr: SocketAddr) -> Self {
        Self { store, bind_addr }
    }

    /// Bind the configured address and serve forever
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle_request(req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route a request
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = query_params(req.uri().query());

        debug!(method = %method, path = %path, "Incoming request");

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let result = match (method.clone(), segments.as_slice()) {
            (Method::GET, ["health"]) => Ok(self.handle_health()),
            (Method::GET, ["listing"]) => self.handle_listing().await,
            (Method::GET, [id]) | (Method::HEAD, [id]) => {
                self.handle_get(id, req.headers(), &query, method == Method::HEAD)
                    .await
            }
            (Method::POST, [name]) => {
                let name = decode_segment(name);
                let custom = custom_value(&query);
                let payload = body_payload(req.into_body());
                self.store
                    .insert(&name, payload, custom)
                    .await
                    .map(|stored| stored_response(StatusCode::CREATED, &stored))
            }
            (Method::PUT, [id, name]) => match parse_id(id) {
                Ok(id) => {
                    let name = decode_segment(name);
                    let custom = custom_value(&query);
                    let payload = body_payload(req.into_body());
                    self.store
                        .update(id, &name, payload, custom)
                        .await
                        .map(|stored| stored_response(StatusCode::OK, &stored))
                }
                Err(e) => Err(e),
            },
            (Method::DELETE, [id]) => match parse_id(id) {
                Ok(id) => self.store.remove(id).await.map(|_| {
                    let mut response = Response::new(full_body(Bytes::new()));
                    *response.status_mut() = StatusCode::NO_CONTENT;
                    response
                }),
                Err(e) => Err(e),
            },
            _ => Ok(not_found()),
        };

        match result {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    fn handle_health(&self) -> Response<BoxBody> {
        let catalog = self.store.catalog();
        let body = serde_json::json!({
            "status": "ok",
            "lastId": catalog.last_id,
            "count": catalog.count,
        });
        json_response(StatusCode::OK, &body)
    }

    async fn handle_listing(&self) -> Result<Response<BoxBody>> {
        let listing = self.store.listing().await?;
        let mut response = Response::new(full_body(listing));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Ok(response)
    }

    async fn handle_get(
        &self,
        raw_id: &str,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
        head_only: bool,
    ) -> Result<Response<BoxBody>> {
        let id = parse_id(raw_id)?;

        let download = query.get("download").map(|name| {
            if name.is_empty() {
                Download::Original
            } else {
                Download::Named(name.as_str())
            }
        });

        let response = self.store.pipe(id, Some(headers), download).await;
        if head_only {
            let (parts, _) = response.into_parts();
            return Ok(Response::from_parts(parts, full_body(Bytes::new())));
        }
        Ok(response)
    }
}

fn query_params(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// `custom` query value: JSON when it parses, a plain string otherwise
fn custom_value(query: &HashMap<String, String>) -> Option<serde_json::Value> {
    query.get("custom").map(|raw| {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.clone()))
    })
}

/// Stream a request body straight into ingestion
fn body_payload<B>(body: B) -> Payload
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader: PayloadReader = Box::new(StreamReader::new(stream));
    Payload::Reader(reader)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<BoxBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn stored_response(status: StatusCode, stored: &Stored) -> Response<BoxBody> {
    json_response(
        status,
        &serde_json::json!({ "id": stored.id, "header": stored.header }),
    )
}

fn error_response(err: &StorageError) -> Response<BoxBody> {
    match err {
        StorageError::NotFound(_) => not_found(),
        StorageError::MalformedInput(_) | StorageError::HeaderTooLarge { .. } => json_response(
            StatusCode::BAD_REQUEST,
            &serde_json::json!({ "error": err.to_string() }),
        ),
        _ => {
            error!(error = %err, "Request error");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &serde_json::json!({ "error": "internal storage error" }),
            )
        }
    }
}

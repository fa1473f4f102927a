//! In-process HTTP origin for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use aes::Aes128;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use cipher::block_padding::Pkcs7;
use cipher::{BlockModeEncrypt, KeyIvInit};
use parking_lot::Mutex;
use reqwest::Client;
use spool_engine::{DownloaderConfig, create_client};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Clone)]
pub enum Route {
    /// Static body honouring `Range` requests
    Body(Bytes),
    /// Static body always served whole with 200
    IgnoreRange(Bytes),
    Status(StatusCode),
}

#[derive(Default)]
struct Origin {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, HeaderMap)>>,
}

pub struct TestServer {
    base_url: String,
    origin: Arc<Origin>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let origin = Arc::new(Origin::default());
        let router = Router::new().fallback(serve).with_state(origin.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("read listener address");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
        tokio::spawn(async move {
            server.await.expect("run test server");
        });

        Self {
            base_url: format!("http://{addr}/"),
            origin,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn route(&self, path: &str, route: Route) {
        self.origin
            .routes
            .lock()
            .insert(normalize(path), route);
    }

    pub fn body(&self, path: &str, body: impl Into<Bytes>) {
        self.route(path, Route::Body(body.into()));
    }

    pub fn text(&self, path: &str, body: &str) {
        self.body(path, Bytes::copy_from_slice(body.as_bytes()));
    }

    pub fn hits(&self, path: &str) -> usize {
        self.origin
            .hits
            .lock()
            .get(&normalize(path))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.origin.hits.lock().values().sum()
    }

    /// Values of `name` on every request to `path`, in arrival order.
    pub fn header_values(&self, path: &str, name: &str) -> Vec<Option<String>> {
        let path = normalize(path);
        self.origin
            .requests
            .lock()
            .iter()
            .filter(|(p, _)| *p == path)
            .map(|(_, headers)| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

async fn serve(State(origin): State<Arc<Origin>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    *origin.hits.lock().entry(path.clone()).or_default() += 1;
    origin.requests.lock().push((path.clone(), headers.clone()));

    let route = origin.routes.lock().get(&path).cloned();
    match route {
        None => StatusCode::NOT_FOUND.into_response(),
        Some(Route::Status(status)) => status.into_response(),
        Some(Route::IgnoreRange(body)) => (StatusCode::OK, body).into_response(),
        Some(Route::Body(body)) => {
            let range = headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(|v| parse_range(v, body.len()));
            match range {
                None => (StatusCode::OK, body).into_response(),
                Some(Some((start, end))) => (
                    StatusCode::PARTIAL_CONTENT,
                    [(
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{}", body.len()),
                    )],
                    body.slice(start..=end),
                )
                    .into_response(),
                Some(None) => (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", body.len()))],
                )
                    .into_response(),
            }
        }
    }
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    if start >= len {
        return None;
    }
    let end = if end.is_empty() {
        len - 1
    } else {
        end.parse::<usize>().ok()?.min(len - 1)
    };
    (start <= end).then_some((start, end))
}

pub fn client() -> Client {
    create_client(&DownloaderConfig {
        use_system_proxy: false,
        ..Default::default()
    })
    .expect("build test client")
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let cipher = cbc::Encryptor::<Aes128>::new_from_slices(key, iv).expect("init cipher");
    let mut buffer = vec![0u8; (plaintext.len() / 16 + 1) * 16];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cipher
        .encrypt_padded::<Pkcs7>(&mut buffer, plaintext.len())
        .expect("encrypt")
        .to_vec()
}

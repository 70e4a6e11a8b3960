use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;

use crate::client;
use crate::store::{SharedKeystore, StoreError};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Clone)]
pub struct WebState {
    pub store: SharedKeystore,
}

/// Binds the listener and serves the keystore API until the shutdown future
/// resolves. `host` may be a hostname or an IP literal.
pub async fn run<F>(host: &str, port: u16, state: WebState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("bind key server at {host}:{port}"))?;
    let addr = listener
        .local_addr()
        .context("resolve key server local address")?;
    tracing::info!(%addr, "key server listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .with_context(|| format!("serve keystore api at {host}:{port}"))?;

    Ok(())
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/keystore/version", get(get_version))
        .route("/keystore/info", get(get_info))
        .route("/keystore/:key", get(get_key).post(set_key))
        .with_state(state)
}

async fn get_version() -> String {
    format!("version: {}", env!("CARGO_PKG_VERSION"))
}

/// Diagnostic page: echoes the request headers and the peer address so
/// operators can see what identity a proxy chain presents.
async fn get_info(headers: HeaderMap, ConnectInfo(peer): ConnectInfo<SocketAddr>) -> Html<String> {
    let mut rows = String::new();
    for (name, value) in &headers {
        let value = value.to_str().unwrap_or("<non-text value>");
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            html_escape(name.as_str()),
            html_escape(value),
        ));
    }
    Html(format!(
        "<html><head><title>keystore info</title></head><body>\n\
         <p>peer: {peer}</p>\n<table>\n{rows}</table>\n</body></html>\n"
    ))
}

async fn get_key(
    State(state): State<WebState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let client = client::resolve(forwarded_for(&headers), Some(peer));
    match state.store.get(&client, &key) {
        Ok(value) => (StatusCode::OK, value).into_response(),
        Err(err) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetForm {
    value: Option<String>,
}

/// Stores the posted `value` under the caller's namespace. An absent or
/// unparsable form field keeps the legacy response: 404 with body `ERROR`.
async fn set_key(
    State(state): State<WebState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    form: Option<Form<SetForm>>,
) -> Response {
    let client = client::resolve(forwarded_for(&headers), Some(peer));
    let result = match form.and_then(|Form(form)| form.value) {
        Some(value) => state.store.set(&client, &key, &value),
        None => Err(StoreError::InvalidRequest),
    };
    match result {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(err) => {
            tracing::debug!(%client, %key, error = %err, "rejected write");
            (StatusCode::NOT_FOUND, "ERROR").into_response()
        }
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<&str> {
    headers.get(X_FORWARDED_FOR)?.to_str().ok()
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

//! The admin HTTP endpoint: `POST /v1/reload` and the Prometheus
//! text endpoint, served together on the reload listen address.

use axum::{extract::State, http::StatusCode, routing};
use prometheus::TextEncoder;
use std::net::SocketAddr;
use tokio::sync::oneshot;

use crate::reload::{ReloadRequest, ReloadSender};

async fn post_reload(State(reload_tx): State<ReloadSender>) -> (StatusCode, String) {
    let (reply_tx, reply_rx) = oneshot::channel();

    if reload_tx
        .send(ReloadRequest {
            reply: Some(reply_tx),
        })
        .await
        .is_err()
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "reload task is gone\n".to_string(),
        );
    }

    match reply_rx.await {
        Ok(Ok(())) => (StatusCode::OK, "OK\n".to_string()),
        Ok(Err(error)) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{error}\n")),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "reload task dropped the request\n".to_string(),
        ),
    }
}

async fn get_metrics() -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => (StatusCode::OK, metrics_str),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

pub async fn serve_admin_endpoint_task(
    address: SocketAddr,
    reload_tx: ReloadSender,
) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route("/v1/reload", routing::post(post_reload))
        .route("/metrics", routing::get(get_metrics))
        .with_state(reload_tx);
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

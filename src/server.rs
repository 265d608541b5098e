// tee-signer: mTLS listener and HTTP routing

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::SignerConfig;
use crate::error::{SignerError, SignerResult};
use crate::health::HealthChecker;
use crate::service::{DomainSignRequest, SignRequest, SignerService};
use crate::tls;

/// Identity extracted from the verified client certificate, attached to
/// every request on the connection.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Subject CN; empty when the certificate carries none
    pub common_name: String,
}

#[derive(Clone)]
struct AppState {
    service: Arc<SignerService>,
    health: Arc<HealthChecker>,
    admin_cns: Arc<Vec<String>>,
}

/// Accept mTLS connections and serve the signing API until `shutdown`
/// resolves.
///
/// Each connection handshakes through rustls with mandatory client
/// verification, has its peer CN extracted once, and is then served by the
/// shared router with the identity attached as an extension.
pub async fn serve<F>(
    config: &SignerConfig,
    service: Arc<SignerService>,
    health: Arc<HealthChecker>,
    shutdown: F,
) -> SignerResult<()>
where
    F: Future<Output = ()>,
{
    let tls_config = tls::build_server_config(&config.tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .map_err(|e| {
            SignerError::config_error(format!(
                "failed to bind {}: {}",
                config.server.bind_address, e
            ))
        })?;
    info!(address = %config.server.bind_address, "signing service listening");

    let state = AppState {
        service,
        health,
        admin_cns: Arc::new(config.server.admin_common_names.clone()),
    };
    let router = build_router(state);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping listener");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                            return;
                        }
                    };

                    let identity = ClientIdentity {
                        common_name: peer_common_name(tls_stream.get_ref().1),
                    };
                    let connection_router = router.layer(Extension(identity));
                    let hyper_service =
                        hyper::service::service_fn(move |request: Request<Incoming>| {
                            connection_router.clone().oneshot(request)
                        });

                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls_stream), hyper_service)
                        .await
                    {
                        debug!(peer = %peer_addr, error = %e, "connection closed with error");
                    }
                });
            }
        }
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sign", post(handle_sign))
        .route("/v1/sign-domain", post(handle_sign_domain))
        .route("/v1/admin/rotate-key", post(handle_rotate_key))
        .route("/healthz", get(handle_health))
        .route("/v1/metrics", get(handle_metrics))
        .with_state(state)
}

/// Subject CN of the connection's verified end-entity certificate.
fn peer_common_name(connection: &rustls::ServerConnection) -> String {
    let Some(cert) = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
    else {
        return String::new();
    };

    match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap_or_default()
            .to_string(),
        Err(e) => {
            debug!(error = %e, "failed to parse client certificate");
            String::new()
        }
    }
}

async fn handle_sign(
    State(state): State<AppState>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<SignRequest>,
) -> Response {
    match state.service.sign(&identity.common_name, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_sign_domain(
    State(state): State<AppState>,
    Extension(identity): Extension<ClientIdentity>,
    Json(request): Json<DomainSignRequest>,
) -> Response {
    match state
        .service
        .sign_with_domain(&identity.common_name, request)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_rotate_key(
    State(state): State<AppState>,
    Extension(identity): Extension<ClientIdentity>,
) -> Response {
    if state.admin_cns.is_empty() {
        return error_response(&SignerError::unauthenticated(
            "administrative interface is disabled",
        ));
    }
    if !state.admin_cns.iter().any(|cn| cn == &identity.common_name) {
        warn!(client_cn = %identity.common_name, "rejected administrative rotation");
        return error_response(&SignerError::permission_denied(
            "client is not an administrative identity",
        ));
    }

    match state.service.rotate_key().await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let status = state.health.status();
    let code = if status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    Json(state.service.metrics_snapshot()).into_response()
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

fn error_response(err: &SignerError) -> Response {
    let status = match err.code() {
        "invalid-argument" => StatusCode::BAD_REQUEST,
        "unauthenticated" => StatusCode::UNAUTHORIZED,
        "permission-denied" => StatusCode::FORBIDDEN,
        "resource-exhausted" => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // internal detail stays in the logs
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "internal error".to_string()
    } else {
        err.to_string()
    };

    (
        status,
        Json(ErrorBody {
            code: err.code(),
            message,
        }),
    )
        .into_response()
}

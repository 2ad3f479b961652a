use crate::admission::{AdmissionError, AdmittedPod, decide};
use crate::config::Tls;
use crate::notifier::Notifier;
use crate::state::AppState;
use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

static POD_KIND: &str = "Pod";
static GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

type ReviewResponse = (StatusCode, Json<AdmissionReview<DynamicObject>>);

/// Reasons a request never reaches the policy engine, or is not evaluated by it.
#[derive(Debug)]
enum RequestError {
    UnsupportedKind(String),
    MissingObject,
    UndecodablePod(serde_json::Error),
    Admission(AdmissionError),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::UnsupportedKind(kind) => {
                write!(f, "unsupported resource kind {}, only pods are validated", kind)
            }
            RequestError::MissingObject => write!(f, "admission request contains no object"),
            RequestError::UndecodablePod(e) => write!(f, "failed to decode pod: {}", e),
            RequestError::Admission(e) => write!(f, "{}", e),
        }
    }
}

pub async fn readiness() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn ping() -> impl IntoResponse {
    StatusCode::OK
}

pub fn create_app<N: Notifier + 'static>(state: Arc<AppState<N>>) -> Router {
    Router::new()
        .route("/validate", post(validate::<N>))
        .route("/ping", get(ping))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .with_state(state)
}

async fn validate<N: Notifier + 'static>(
    State(state): State<Arc<AppState<N>>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> ReviewResponse {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to extract admission request: {}", e);
            return invalid_review(format!("Invalid AdmissionReview: {}", e));
        }
    };

    info!(
        "Serving admission request {} ({:?} {} {} in namespace {})",
        request.uid,
        request.operation,
        request.kind.kind,
        request.name,
        request.namespace.as_deref().unwrap_or_default()
    );

    if request.kind.kind != POD_KIND || !request.kind.group.is_empty() {
        let e = RequestError::UnsupportedKind(request.kind.kind.clone());
        error!("Rejecting admission request {}: {}", request.uid, e);
        return bad_request(&request, e);
    }

    if request.operation == Operation::Delete {
        info!("Admission request {} allowed (DELETE)", request.uid);
        return (
            StatusCode::OK,
            Json(AdmissionResponse::from(&request).into_review()),
        );
    }

    match review_pod(&state, &request).await {
        Ok(None) => {
            info!("Admission request {} allowed", request.uid);
            (
                StatusCode::OK,
                Json(AdmissionResponse::from(&request).into_review()),
            )
        }
        Ok(Some(reason)) => {
            warn!("Admission request {} denied: {}", request.uid, reason);
            (
                StatusCode::OK,
                Json(AdmissionResponse::from(&request).deny(reason).into_review()),
            )
        }
        Err(e) => {
            error!("Rejecting malformed admission request {}: {}", request.uid, e);
            bad_request(&request, e)
        }
    }
}

/// Decodes the pod and runs the policy. `Ok(Some(reason))` is a policy denial.
/// The resource kind has already been checked by the caller.
async fn review_pod<N: Notifier>(
    state: &AppState<N>,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Option<String>, RequestError> {
    let object = request.object.as_ref().ok_or(RequestError::MissingObject)?;
    let pod: Pod = serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(RequestError::UndecodablePod)?;

    let admitted = AdmittedPod::from_pod(
        &pod,
        request.namespace.as_deref(),
        Some(request.name.as_str()),
    );
    let verdict = decide(
        &admitted,
        &state.policy,
        &state.notifier,
        state.notify_timeout,
    )
    .await
    .map_err(RequestError::Admission)?;

    if verdict.allowed {
        Ok(None)
    } else {
        Ok(Some(verdict.reason.unwrap_or_default()))
    }
}

/// Input error on a decoded request: keeps the request uid and apiVersion in the response.
fn bad_request(request: &AdmissionRequest<DynamicObject>, e: RequestError) -> ReviewResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(
            AdmissionResponse::from(request)
                .deny(e.to_string())
                .into_review(),
        ),
    )
}

fn invalid_review(message: String) -> ReviewResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(AdmissionResponse::invalid(message).into_review()),
    )
}

/// Serves the app over TLS until SIGINT or SIGTERM is received.
pub async fn serve(app: Router, tls: &Tls, port: u16) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .with_context(|| {
            format!(
                "Failed to load TLS certificate {} and key {}",
                tls.cert_path.display(),
                tls.key_path.display()
            )
        })?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    info!("Starting webhook server on {}", addr);
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("Webhook server failed")?;

    info!("Webhook server stopped");
    Ok(())
}

async fn shutdown_on_signal(handle: Handle) {
    shutdown_signal().await;
    info!("Shutdown signal received, draining connections");
    handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

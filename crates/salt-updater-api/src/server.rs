//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Networking API surface for external integrations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use prometheus::{Encoder, TextEncoder};
use salt_updater_common::RpcConfig;
use salt_updater_core::{OrchestratorError, SharedRegistry, UpdateOrchestrator, UpdateRequest};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{error_name, RpcMethod};

/// Shared state handed to every handler.
pub struct RpcState {
    orchestrator: UpdateOrchestrator,
    registry: Option<SharedRegistry>,
}

impl RpcState {
    pub fn new(orchestrator: UpdateOrchestrator, registry: Option<SharedRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }
}

#[derive(Clone)]
struct Identity(Arc<str>);

/// Handle to the running RPC server.
#[derive(Debug)]
pub struct RpcServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RpcServer {
    /// Address actually bound, useful when the configured port was `0`.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

fn router(state: Arc<RpcState>, identities: &[String]) -> Router {
    let methods: Router<Arc<RpcState>> = Router::new().route("/:method", post(dispatch));

    let mut router = Router::new().route("/metrics", get(metrics_handler));
    for identity in identities {
        router = router.nest(
            &format!("/{identity}"),
            methods
                .clone()
                .layer(Extension(Identity(Arc::from(identity.as_str())))),
        );
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind the configured listener and serve the RPC surface under every identity.
pub fn spawn_rpc_server(state: Arc<RpcState>, config: &RpcConfig) -> Result<RpcServer> {
    let app = router(state, &config.identities);

    let listener = StdTcpListener::bind(config.listen)
        .with_context(|| format!("failed to bind RPC listener {}", config.listen))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure RPC listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read RPC listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let identities = config.identities.join(", ");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, identities = %identities, "rpc server listening");
        if let Err(err) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(error = %err, "rpc server terminated unexpectedly");
            return Err(err.into());
        }
        info!("rpc server stopped");
        Ok(())
    });

    Ok(RpcServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn dispatch(
    State(state): State<Arc<RpcState>>,
    Extension(identity): Extension<Identity>,
    Path(method): Path<String>,
    body: Bytes,
) -> Result<Response, RpcError> {
    let method = method
        .parse::<RpcMethod>()
        .map_err(|message| RpcError::new(StatusCode::NOT_FOUND, &identity.0, &method, message))?;
    debug!(identity = %identity.0, method = %method, "rpc call");
    let orchestrator = &state.orchestrator;
    let fail = |err: OrchestratorError| RpcError::from_orchestrator(&identity.0, method, err);

    let response = match method {
        RpcMethod::IsRunning => Json(orchestrator.is_running()).into_response(),
        RpcMethod::RunUpdate | RpcMethod::ForceUpdate => {
            let force = method == RpcMethod::ForceUpdate;
            match orchestrator.request_update(force).await {
                UpdateRequest::Started(_) => debug!(force, "update started"),
                UpdateRequest::NoUpdateAvailable => debug!("no update available"),
                UpdateRequest::AlreadyRunning => debug!("update request dropped"),
            }
            StatusCode::NO_CONTENT.into_response()
        }
        RpcMethod::RunPing => {
            if orchestrator.ping().is_none() {
                debug!("ping request dropped");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        RpcMethod::RunPingSync => Json(orchestrator.ping_sync().await.map_err(fail)?).into_response(),
        RpcMethod::State => Json(orchestrator.state()).into_response(),
        RpcMethod::SetAutoUpdate => {
            let enabled: bool = serde_json::from_slice(&body).map_err(|err| {
                RpcError::new(
                    StatusCode::BAD_REQUEST,
                    &identity.0,
                    method.as_str(),
                    format!("expected a boolean argument: {err}"),
                )
            })?;
            orchestrator.set_auto_update(enabled).await.map_err(fail)?;
            StatusCode::NO_CONTENT.into_response()
        }
        RpcMethod::IsAutoUpdateOn => {
            Json(orchestrator.is_auto_update_on().await.map_err(fail)?).into_response()
        }
    };
    Ok(response)
}

async fn metrics_handler(State(state): State<Arc<RpcState>>) -> Response {
    let Some(registry) = &state.registry else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            buffer,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {err}"),
            )
                .into_response()
        }
    }
}

/// Error returned to RPC callers.
#[derive(Debug)]
pub struct RpcError {
    status: StatusCode,
    name: String,
    message: String,
}

impl RpcError {
    fn new(status: StatusCode, identity: &str, method: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            name: error_name(identity, method),
            message: message.into(),
        }
    }

    fn from_orchestrator(identity: &str, method: RpcMethod, err: OrchestratorError) -> Self {
        let status = if err.is_guard() {
            StatusCode::CONFLICT
        } else if err.is_parse() {
            StatusCode::UNPROCESSABLE_ENTITY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        warn!(method = %method, error = %err, "rpc call failed");
        Self::new(status, identity, method.as_str(), err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Wire body of a failed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub name: String,
    pub message: String,
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            name: self.name,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_errors_map_to_conflict() {
        let err = RpcError::from_orchestrator(
            "org.cacophony.saltupdater",
            RpcMethod::RunPingSync,
            OrchestratorError::AlreadyRunning,
        );
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.name(), "org.cacophony.saltupdater.RunPingSync");
    }
}

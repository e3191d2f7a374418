use crate::batch::{Batch, Column};
use crate::error::FeatureStoreError;
use crate::info;
use crate::online_store::WriteSummary;
use crate::retrieval::{FeatureSelection, FeatureStore, OnlineRequest};
use crate::schema::EntityRow;
use crate::value::Value;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] FeatureStoreError),

    #[error(transparent)]
    JsonRejection(#[from] JsonRejection),

    #[error("{0}")]
    BadRequest(String),

    #[error("Join: {0}")]
    Join(#[from] JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bind address: {0}")]
    Address(#[from] std::net::AddrParseError),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Store(FeatureStoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServerError::Store(
                FeatureStoreError::InvalidFeatureRef(_)
                | FeatureStoreError::MissingEntityKey { .. }
                | FeatureStoreError::InvalidEntityValue { .. }
                | FeatureStoreError::PushValidation { .. }
                | FeatureStoreError::Batch(_),
            ) => StatusCode::BAD_REQUEST,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::JsonRejection(r) => r.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Wraps `axum::Json` so that rejections are rendered like every other error.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ServerError))]
pub struct AppJson<T>(pub T);

impl<T> IntoResponse for AppJson<T>
where
    axum::Json<T>: IntoResponse,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: u16,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            ServerError::JsonRejection(rej) => rej.body_text(),
            other => other.to_string(),
        };
        (status, AppJson(ErrorResponse { message, code: status.as_u16() })).into_response()
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<FeatureStore>,
}

type JsonColumns = BTreeMap<String, Vec<serde_json::Value>>;

#[derive(Debug, Deserialize)]
pub struct GetOnlineFeaturesBody {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub feature_service: Option<String>,
    pub entities: JsonColumns,
    #[serde(default)]
    pub full_feature_names: bool,
    #[serde(default)]
    pub update: bool,
}

#[derive(Debug, Deserialize)]
pub struct PushBody {
    pub push_source_name: String,
    pub df: JsonColumns,
}

fn decode_columns(columns: JsonColumns) -> Result<Vec<Column>, ServerError> {
    let mut decoded = Vec::with_capacity(columns.len());
    let mut rows: Option<usize> = None;
    for (name, values) in columns {
        if *rows.get_or_insert(values.len()) != values.len() {
            return Err(ServerError::BadRequest(format!("column '{}' has {} values, other columns have {}", name, values.len(), rows.unwrap_or(0))));
        }
        let values = values
            .iter()
            .map(|v| Value::from_json(v).ok_or_else(|| ServerError::BadRequest(format!("column '{}' has unsupported value {}", name, v))))
            .collect::<Result<Vec<_>, _>>()?;
        decoded.push(Column::new(name, values));
    }
    Ok(decoded)
}

impl GetOnlineFeaturesBody {
    fn into_request(self) -> Result<OnlineRequest, ServerError> {
        let features = match (self.feature_service, self.features.is_empty()) {
            (Some(service), true) => FeatureSelection::Service(service),
            (None, false) => FeatureSelection::Refs(self.features),
            _ => return Err(ServerError::BadRequest("exactly one of 'features' or 'feature_service' must be given".to_string())),
        };
        let batch = Batch::from_columns(decode_columns(self.entities)?).map_err(FeatureStoreError::from)?;
        let entity_rows = batch.rows().into_iter().map(|row| row.into_iter().collect::<EntityRow>()).collect();
        Ok(OnlineRequest { features, entity_rows, full_feature_names: self.full_feature_names })
    }
}

async fn health() -> AppJson<serde_json::Value> {
    AppJson(json!({ "status": "ok" }))
}

async fn get_online_features(State(state): State<ServerState>, AppJson(body): AppJson<GetOnlineFeaturesBody>) -> Result<AppJson<serde_json::Value>, ServerError> {
    let update = body.update;
    let request = body.into_request()?;
    let store = Arc::clone(&state.store);
    let response = tokio::task::spawn_blocking(move || {
        if update {
            store.get_online_features_and_update(&request)
        } else {
            store.get_online_features(&request)
        }
    })
    .await??;
    Ok(AppJson(response.to_json()))
}

async fn push(State(state): State<ServerState>, AppJson(body): AppJson<PushBody>) -> Result<AppJson<WriteSummary>, ServerError> {
    let batch = Batch::from_columns(decode_columns(body.df)?).map_err(FeatureStoreError::from)?;
    let store = Arc::clone(&state.store);
    let summary = tokio::task::spawn_blocking(move || store.push(&body.push_source_name, &batch)).await??;
    Ok(AppJson(summary))
}

pub fn build_router(state: ServerState) -> Router<()> {
    Router::new()
        .route("/health", get(health))
        .route("/get-online-features", post(get_online_features))
        .route("/push", post(push))
        .with_state(state)
}

pub async fn serve(state: ServerState, socket_addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
    let router = build_router(state);
    let tcp = TcpListener::bind(socket_addr).await?;
    info!("Feature server listening on {}", socket_addr);

    let mut shutdown = shutdown.clone();
    axum::serve(tcp, router)
        .with_graceful_shutdown(async move {
            if shutdown.changed().await.is_ok() {
                info!("Shutting down server...");
            }
        })
        .await?;
    Ok(())
}

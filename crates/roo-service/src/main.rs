use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use roo_api::{
    load_config, MigrateResult, ResolutionPackage, ResolveRequest, RulesOfOriginApi,
    API_CONTRACT_VERSION,
};
use roo_core::ResolveError;
use roo_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RulesOfOriginApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "roo-service")]
#[command(about = "Local HTTP service for rules of origin resolution")]
struct Args {
    #[arg(long, default_value = "./rules_of_origin.sqlite3")]
    db: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let (status, error_kind) = match err.downcast_ref::<ResolveError>() {
            Some(resolve) if resolve.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
            Some(resolve) if resolve.is_data_integrity() => {
                (StatusCode::INTERNAL_SERVER_ERROR, "data_integrity")
            }
            _ => (StatusCode::BAD_REQUEST, "invalid_request"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %format!("{err:#}"), "request failed on inconsistent rules data");
        }
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind,
            error: format!("{err:#}"),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/rules-of-origin", post(rules_of_origin))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let state = ServiceState { api: RulesOfOriginApi::new(args.db, config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "rules of origin service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn rules_of_origin(
    State(state): State<ServiceState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ServiceEnvelope<ResolutionPackage>>, ServiceError> {
    let package = state.api.resolve(request)?;
    Ok(Json(envelope(package)))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use roo_api::ResolverConfig;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("roo-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn seeded_state() -> ServiceState {
        let api = RulesOfOriginApi::new(unique_temp_db_path(), ResolverConfig::default());
        let dataset = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample_dataset.json");
        if let Err(err) = api.import_dataset(&dataset) {
            panic!("failed to import {}: {err:#}", dataset.display());
        }
        ServiceState { api }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_resolve(router: Router, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri("/v1/rules-of-origin")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build resolve request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("resolve request failed: {err}"),
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState {
            api: RulesOfOriginApi::new(unique_temp_db_path(), ResolverConfig::default()),
        };
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn resolve_returns_rules_keyed_by_document() {
        let router = app(seeded_state());
        let payload = serde_json::json!({
            "country_code": "KA",
            "commodity_code": "0101210000",
            "as_of": "2022-06-01T00:00:00Z"
        });
        let response = post_resolve(router, &payload).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let rules = value
            .pointer("/data/documents/Kaland Agreement/rules")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing rules in response: {value}"));
        let codes: Vec<&str> = rules
            .iter()
            .filter_map(|rule| rule.pointer("/rule/code").and_then(serde_json::Value::as_str))
            .collect();
        assert_eq!(codes, vec!["Chapter 01", "0101.21"]);
        assert_eq!(
            value
                .pointer("/data/documents/Kaland Agreement/introductory_notes/identifier")
                .and_then(serde_json::Value::as_str),
            Some("COMM")
        );
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn resolve_errors_map_to_status_codes() {
        let state = seeded_state();
        let cases = [
            ("ZZ", "0101210000", StatusCode::NOT_FOUND, "not_found"),
            ("KA", "0301000000", StatusCode::NOT_FOUND, "not_found"),
            ("KB", "0101210000", StatusCode::INTERNAL_SERVER_ERROR, "data_integrity"),
            ("KA", "01012", StatusCode::BAD_REQUEST, "invalid_request"),
        ];
        for (country, code, expected_status, expected_kind) in cases {
            let payload = serde_json::json!({ "country_code": country, "commodity_code": code });
            let response = post_resolve(app(state.clone()), &payload).await;
            assert_eq!(response.status(), expected_status, "{country} {code}");
            let value = response_json(response).await;
            assert_eq!(
                value.get("error_kind").and_then(serde_json::Value::as_str),
                Some(expected_kind)
            );
        }
    }

    #[tokio::test]
    async fn country_without_matching_rules_gets_empty_mapping() {
        let router = app(seeded_state());
        let payload = serde_json::json!({
            "country_code": "KB",
            "commodity_code": "0201100000",
            "as_of": "2022-06-01T00:00:00Z"
        });
        let response = post_resolve(router, &payload).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.pointer("/data/documents"), Some(&serde_json::json!({})));
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = ServiceState {
            api: RulesOfOriginApi::new(unique_temp_db_path(), ResolverConfig::default()),
        };
        let response = match app(state)
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/rules-of-origin"));
    }

    #[tokio::test]
    async fn migrate_dry_run_reports_pending_versions() {
        let state = ServiceState {
            api: RulesOfOriginApi::new(unique_temp_db_path(), ResolverConfig::default()),
        };
        let response = match app(state)
            .oneshot(
                Request::builder()
                    .uri("/v1/db/migrate")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"dry_run":true}"#))
                    .unwrap_or_else(|err| panic!("failed to build migrate request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("migrate request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/would_apply_versions"),
            Some(&serde_json::json!([1]))
        );
    }
}

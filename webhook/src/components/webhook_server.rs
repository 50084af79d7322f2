/*
This file contains the admission webhook endpoints.
`/mutate-pod` places new pods, `/validate-pod` keeps their
placement label immutable and `/validate-deployment` and
`/validate-statefulset` reject malformed placement configuration.
Every endpoint speaks admission.k8s.io/v1 AdmissionReview over HTTPS.
*/

use std::{
    sync::Arc,
    time::Duration
};
use axum::{
    Json,
    Router,
    extract::State,
    routing::{
        get,
        post
    }
};
use axum_server::{
    Handle,
    tls_rustls::RustlsConfig
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{
        AdmissionRequest,
        AdmissionResponse,
        AdmissionReview,
        Operation
    }
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn
};

use crate::components::decision::DecisionEngine;
use crate::components::pod_mutation::{
    has_placement_label,
    placement_patch
};
use crate::components::validation::{
    aggregate,
    validate_optimize_scheduling_labels,
    validate_placement_label_update
};
use crate::error::WebhookError;
use crate::utils::configuration::WebhookConfig;



type Review = AdmissionReview<DynamicObject>;
type Request = AdmissionRequest<DynamicObject>;

// Time in-flight admissions get to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// Shared state of the admission handlers.
pub struct WebhookState {
    pub engine: DecisionEngine,
}

impl WebhookState {
    pub fn new(engine: DecisionEngine) -> Self {
        Self { engine }
    }
}

pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate-pod", post(mutate_pod_handler))
        .route("/validate-pod", post(validate_pod_handler))
        .route("/validate-deployment", post(validate_deployment_handler))
        .route("/validate-statefulset", post(validate_stateful_set_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/*
A review without a request cannot even be answered:
the exchange itself fails with a client error.
*/
fn into_request(body: Review) -> Result<Request, WebhookError> {
    let converted: Result<Request, _> = body.try_into();
    converted.map_err(|e| WebhookError::InvalidReview(e.to_string()))
}

fn decode<K: DeserializeOwned>(kind: &'static str, obj: &DynamicObject) -> Result<K, WebhookError> {
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value).map_err(|source| WebhookError::Decode { kind, source })
}

fn object_of<'a>(request: &'a Request, what: &str) -> Result<&'a DynamicObject, WebhookError> {
    request
        .object
        .as_ref()
        .ok_or_else(|| WebhookError::InvalidReview(format!("{what} request carries no object")))
}

/*
This function turns the outcome of one admission into the
response sent back. Failures deny the single request and never
touch the cache.
*/
fn settle(request: &Request, outcome: Result<AdmissionResponse, WebhookError>) -> Review {
    let response = match outcome {
        Ok(response) => response,
        Err(e) if e.is_client_error() => {
            warn!(uid = %request.uid, error = %e, "Rejecting malformed admission request");
            AdmissionResponse::from(request).deny(e.to_string())
        }
        Err(e) => {
            error!(uid = %request.uid, error = %e, "Admission failed");
            AdmissionResponse::from(request).deny(e.to_string())
        }
    };
    response.into_review()
}

pub async fn mutate_pod_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<Review>,
) -> Result<Json<Review>, WebhookError> {
    let request = into_request(body)?;
    let outcome = mutate_pod(&state, &request).await;
    Ok(Json(settle(&request, outcome)))
}

async fn mutate_pod(state: &WebhookState, request: &Request) -> Result<AdmissionResponse, WebhookError> {
    if !matches!(request.operation, Operation::Create) {
        return Ok(AdmissionResponse::from(request));
    }

    let pod: Pod = decode("Pod", object_of(request, "CREATE")?)?;
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .or(request.namespace.as_deref())
        .unwrap_or_default();

    // A retried admission of the same creation was already placed.
    if has_placement_label(&pod) {
        debug!(uid = %request.uid, namespace = %namespace, "Pod already placed, allowing unchanged");
        return Ok(AdmissionResponse::from(request));
    }

    let placement = state.engine.decide(&pod, namespace).await;
    let Some(patch) = placement_patch(&pod, placement)? else {
        return Ok(AdmissionResponse::from(request));
    };

    info!(
        uid = %request.uid,
        namespace = %namespace,
        pod = %pod.metadata.generate_name.as_deref().or(pod.metadata.name.as_deref()).unwrap_or_default(),
        placement = %placement,
        "Placing pod"
    );
    AdmissionResponse::from(request)
        .with_patch(patch)
        .map_err(|e| WebhookError::Patch(e.to_string()))
}

pub async fn validate_pod_handler(Json(body): Json<Review>) -> Result<Json<Review>, WebhookError> {
    let request = into_request(body)?;
    let outcome = validate_pod(&request);
    Ok(Json(settle(&request, outcome)))
}

fn validate_pod(request: &Request) -> Result<AdmissionResponse, WebhookError> {
    if !matches!(request.operation, Operation::Update) {
        return Ok(AdmissionResponse::from(request));
    }

    let new = object_of(request, "UPDATE")?;
    let old = request
        .old_object
        .as_ref()
        .ok_or_else(|| WebhookError::InvalidReview("UPDATE request carries no old object".to_string()))?;

    debug!(uid = %request.uid, namespace = ?request.namespace, pod = %request.name, "Validating pod update");
    match validate_placement_label_update(old.metadata.labels.as_ref(), new.metadata.labels.as_ref()) {
        Ok(()) => Ok(AdmissionResponse::from(request)),
        Err(reason) => {
            info!(uid = %request.uid, pod = %request.name, "Denied placement label change");
            Ok(AdmissionResponse::from(request).deny(reason))
        }
    }
}

pub async fn validate_deployment_handler(Json(body): Json<Review>) -> Result<Json<Review>, WebhookError> {
    let request = into_request(body)?;
    let outcome = validate_workload("Deployment", &request);
    Ok(Json(settle(&request, outcome)))
}

pub async fn validate_stateful_set_handler(Json(body): Json<Review>) -> Result<Json<Review>, WebhookError> {
    let request = into_request(body)?;
    let outcome = validate_workload("StatefulSet", &request);
    Ok(Json(settle(&request, outcome)))
}

/*
Deployments and StatefulSets share the same rules,
only their labels are looked at.
*/
fn validate_workload(kind: &str, request: &Request) -> Result<AdmissionResponse, WebhookError> {
    if !matches!(request.operation, Operation::Create | Operation::Update) {
        return Ok(AdmissionResponse::from(request));
    }

    let obj = object_of(request, kind)?;
    debug!(uid = %request.uid, namespace = ?request.namespace, name = %request.name, kind = %kind, "Validating workload");

    let errors = validate_optimize_scheduling_labels(obj.metadata.labels.as_ref());
    if errors.is_empty() {
        return Ok(AdmissionResponse::from(request));
    }
    let reason = aggregate(&errors);
    info!(uid = %request.uid, kind = %kind, name = %request.name, reason = %reason, "Denied workload configuration");
    Ok(AdmissionResponse::from(request).deny(reason))
}

/*
This function serves the router over TLS until the
cancellation token fires, then drains in-flight requests.
*/
pub async fn serve(config: &WebhookConfig, router: Router, cancel: CancellationToken) -> Result<(), WebhookError> {
    let tls = RustlsConfig::from_pem_file(config.cert_path(), config.key_path())
        .await
        .map_err(|e| WebhookError::Tls(format!("{}: {e}", config.cert_path().display())))?;

    let handle = Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        info!("Shutting down admission server");
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let address = config.listen_address();
    info!(address = %address, "Serving admission webhooks");
    axum_server::bind_rustls(address, tls)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

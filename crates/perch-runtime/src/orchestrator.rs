//! [`RequestOrchestrator`] – one synchronous round trip to the pose backend.
//!
//! The orchestrator packs the filtered cloud, the workspace box, the support
//! height, the requested identifiers and the camera pose into a
//! [`LocalizationRequest`], hands it to a [`LocalizationBackend`] under an
//! explicit timeout, and decodes the reply.  Decoding is all-or-nothing: the
//! reply must carry exactly one 16-value transform per requested identifier
//! or the whole call counts as failed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use perch_runtime::orchestrator::{HttpLocalizer, RequestOrchestrator};
//!
//! let backend = HttpLocalizer::new("http://localhost:8765");
//! let orchestrator = RequestOrchestrator::new(Box::new(backend), Duration::from_secs(30));
//! // Requires a running backend – skipped in unit tests.
//! ```

use std::time::Duration;

use async_trait::async_trait;
use perch_types::{
    LocalizationRequest, LocalizationResponse, LocalizationResult, ObjectLocalization,
    OrganizedCloud, PackedCloud, RigidTransform, WorkspaceBounds,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can arise from a backend call.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The HTTP request to the backend failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend answered with an explicit failure.
    #[error("Backend rejected the request: {0}")]
    Rejected(String),
    #[error("Backend did not answer within {0:?}")]
    Timeout(Duration),
    /// The reply could not be decoded into one pose per object.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    #[error("Request cancelled before dispatch")]
    Cancelled,
}

/// The pose-estimation service.
#[async_trait]
pub trait LocalizationBackend: Send + Sync {
    /// Send one request and return the raw reply.
    async fn localize(
        &self,
        request: &LocalizationRequest,
    ) -> Result<LocalizationResponse, BackendError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP backend
// ─────────────────────────────────────────────────────────────────────────────

/// Talks to a backend exposing `POST /localize_objects` with JSON bodies.
pub struct HttpLocalizer {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLocalizer {
    /// `base_url` e.g. `"http://localhost:8765"`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/localize_objects", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LocalizationBackend for HttpLocalizer {
    async fn localize(
        &self,
        request: &LocalizationRequest,
    ) -> Result<LocalizationResponse, BackendError> {
        let response: LocalizationResponse = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Result of [`RequestOrchestrator::localize`].
#[derive(Debug)]
pub enum LocalizationOutcome {
    Localized(LocalizationResult),
    Failed(BackendError),
    /// The cancellation predicate fired before the call went out.
    Cancelled,
}

impl LocalizationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LocalizationOutcome::Localized(_))
    }
}

pub struct RequestOrchestrator {
    backend: Box<dyn LocalizationBackend>,
    timeout: Duration,
}

impl RequestOrchestrator {
    pub fn new(backend: Box<dyn LocalizationBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Assemble the backend request for `object_ids` over `cloud`.
    pub fn build_request(
        &self,
        cloud: &OrganizedCloud,
        bounds: &WorkspaceBounds,
        support_surface_height: f32,
        object_ids: &[String],
        camera_pose: RigidTransform,
    ) -> LocalizationRequest {
        LocalizationRequest {
            x_min: bounds.x_min,
            x_max: bounds.x_max,
            y_min: bounds.y_min,
            y_max: bounds.y_max,
            support_surface_height,
            object_ids: object_ids.to_vec(),
            camera_pose,
            input_organized_cloud: PackedCloud::encode(cloud),
        }
    }

    /// Run one backend call.
    ///
    /// `is_cancelled` is consulted once, right before dispatch.  Once the call
    /// is out it runs to completion or to the orchestrator's timeout.
    pub async fn localize(
        &self,
        request: &LocalizationRequest,
        is_cancelled: impl Fn() -> bool,
    ) -> LocalizationOutcome {
        if is_cancelled() {
            info!("localization cancelled before dispatch");
            return LocalizationOutcome::Cancelled;
        }

        debug!(objects = ?request.object_ids, timeout = ?self.timeout, "calling localization backend");
        let reply = match tokio::time::timeout(self.timeout, self.backend.localize(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(BackendError::Timeout(self.timeout)),
        };

        match reply.and_then(|r| decode_response(&request.object_ids, r)) {
            Ok(result) => LocalizationOutcome::Localized(result),
            Err(e) => {
                warn!(error = %e, "localization failed");
                LocalizationOutcome::Failed(e)
            }
        }
    }
}

/// Decode a reply into one pose per requested identifier, in request order.
///
/// # Errors
///
/// [`BackendError::Rejected`] for an explicit failure reply;
/// [`BackendError::BadResponse`] when the transform count or any matrix is
/// wrong.
pub fn decode_response(
    object_ids: &[String],
    response: LocalizationResponse,
) -> Result<LocalizationResult, BackendError> {
    if !response.success {
        return Err(BackendError::Rejected("backend reported failure".into()));
    }
    if response.object_transforms.len() != object_ids.len() {
        return Err(BackendError::BadResponse(format!(
            "expected {} object transforms, got {}",
            object_ids.len(),
            response.object_transforms.len()
        )));
    }

    let objects = object_ids
        .iter()
        .zip(&response.object_transforms)
        .map(|(id, values)| {
            let transform = RigidTransform::from_wire(values)
                .map_err(|e| BackendError::BadResponse(format!("{id}: {e}")))?;
            info!(object_id = %id, matrix = %transform.matrix(), "decoded object transform");
            Ok(ObjectLocalization {
                object_id: id.clone(),
                transform,
            })
        })
        .collect::<Result<Vec<_>, BackendError>>()?;

    if response.stats_field_names.len() != response.stats.len() {
        warn!(
            names = response.stats_field_names.len(),
            values = response.stats.len(),
            "statistics names and values differ in length"
        );
    }
    let stats: Vec<(String, f64)> = response
        .stats_field_names
        .into_iter()
        .zip(response.stats)
        .collect();
    for (name, value) in &stats {
        info!(stat = %name, value, "localization statistic");
    }

    Ok(LocalizationResult { objects, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_types::PointSample;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed reply and records the requests it saw.
    struct ScriptedBackend {
        reply: Mutex<Option<Result<LocalizationResponse, BackendError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedBackend {
        fn new(reply: Result<LocalizationResponse, BackendError>) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LocalizationBackend for ScriptedBackend {
        async fn localize(
            &self,
            _request: &LocalizationRequest,
        ) -> Result<LocalizationResponse, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(BackendError::BadResponse("no reply scripted".into())))
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn wire(x: f64) -> Vec<f64> {
        RigidTransform::from_translation(x, 0.0, 0.0).to_column_major().to_vec()
    }

    fn response(transforms: Vec<Vec<f64>>) -> LocalizationResponse {
        LocalizationResponse {
            success: true,
            object_transforms: transforms,
            stats_field_names: vec!["score".into()],
            stats: vec![0.9],
        }
    }

    fn request(orchestrator: &RequestOrchestrator, objects: &[&str]) -> LocalizationRequest {
        let cloud = OrganizedCloud::filled(2, 2, PointSample::new(0.1, 0.2, 0.8));
        let bounds = WorkspaceBounds {
            x_min: 0.0,
            x_max: 1.0,
            y_min: -0.5,
            y_max: 0.5,
            z_min: 0.6,
            z_max: 1.25,
        };
        orchestrator.build_request(&cloud, &bounds, 0.7, &ids(objects), RigidTransform::identity())
    }

    #[test]
    fn request_carries_bounds_ids_and_packed_cloud() {
        let orchestrator = RequestOrchestrator::new(
            Box::new(ScriptedBackend::new(Ok(response(vec![])))),
            Duration::from_secs(1),
        );
        let req = request(&orchestrator, &["cup", "bowl"]);
        assert_eq!(req.object_ids, ids(&["cup", "bowl"]));
        assert_eq!((req.x_min, req.y_max), (0.0, 0.5));
        assert!((req.support_surface_height - 0.7).abs() < 1e-6);
        assert_eq!((req.input_organized_cloud.width, req.input_organized_cloud.height), (2, 2));
    }

    #[tokio::test]
    async fn results_follow_request_order() {
        let backend = ScriptedBackend::new(Ok(response(vec![wire(1.0), wire(2.0)])));
        let orchestrator = RequestOrchestrator::new(Box::new(backend), Duration::from_secs(1));
        let req = request(&orchestrator, &["cup", "bowl"]);

        let LocalizationOutcome::Localized(result) = orchestrator.localize(&req, || false).await else {
            panic!("expected success");
        };
        let names: Vec<_> = result.objects.iter().map(|o| o.object_id.as_str()).collect();
        assert_eq!(names, ["cup", "bowl"]);
        assert!((result.objects[0].transform.translation().x - 1.0).abs() < 1e-9);
        assert!((result.objects[1].transform.translation().x - 2.0).abs() < 1e-9);
        assert_eq!(result.stats, vec![("score".to_string(), 0.9)]);
    }

    #[test]
    fn wire_matrices_are_transposed_on_decode() {
        // Row-major reading of this column-major array puts the translation in
        // the bottom row; decoding must move it to the last column.
        let values = wire(3.0);
        let naive = nalgebra::Matrix4::from_row_slice(&values);
        let result = decode_response(&ids(&["cup"]), response(vec![values])).unwrap();
        let decoded = result.objects[0].transform;
        assert!((decoded.matrix() - naive.transpose()).abs().max() < 1e-12);
        assert!((decoded.translation().x - 3.0).abs() < 1e-12);
    }

    #[test]
    fn partial_results_are_rejected() {
        let err = decode_response(&ids(&["cup", "bowl"]), response(vec![wire(1.0)])).unwrap_err();
        assert!(matches!(err, BackendError::BadResponse(_)));

        let mut short = wire(1.0);
        short.pop();
        let err = decode_response(&ids(&["cup"]), response(vec![short])).unwrap_err();
        assert!(matches!(err, BackendError::BadResponse(_)));
    }

    #[test]
    fn explicit_failure_reply_is_rejected() {
        let mut reply = response(vec![wire(1.0)]);
        reply.success = false;
        let err = decode_response(&ids(&["cup"]), reply).unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn transport_error_is_a_failure() {
        let backend = ScriptedBackend::new(Err(BackendError::Rejected("down".into())));
        let orchestrator = RequestOrchestrator::new(Box::new(backend), Duration::from_secs(1));
        let req = request(&orchestrator, &["cup"]);
        assert!(matches!(
            orchestrator.localize(&req, || false).await,
            LocalizationOutcome::Failed(BackendError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let mut backend = ScriptedBackend::new(Ok(response(vec![wire(1.0)])));
        backend.delay = Duration::from_millis(200);
        let orchestrator = RequestOrchestrator::new(Box::new(backend), Duration::from_millis(10));
        let req = request(&orchestrator, &["cup"]);
        assert!(matches!(
            orchestrator.localize(&req, || false).await,
            LocalizationOutcome::Failed(BackendError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_skips_the_call() {
        let backend = std::sync::Arc::new(ScriptedBackend::new(Ok(response(vec![wire(1.0)]))));
        let orchestrator =
            RequestOrchestrator::new(Box::new(SharedBackend(backend.clone())), Duration::from_secs(1));
        let req = request(&orchestrator, &["cup"]);
        assert!(matches!(
            orchestrator.localize(&req, || true).await,
            LocalizationOutcome::Cancelled
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    struct SharedBackend(std::sync::Arc<ScriptedBackend>);

    #[async_trait]
    impl LocalizationBackend for SharedBackend {
        async fn localize(
            &self,
            request: &LocalizationRequest,
        ) -> Result<LocalizationResponse, BackendError> {
            self.0.localize(request).await
        }
    }

    #[tokio::test]
    async fn http_localizer_fails_against_unreachable_backend() {
        let backend = HttpLocalizer::new("http://127.0.0.1:1/");
        assert_eq!(backend.endpoint(), "http://127.0.0.1:1/localize_objects");
        let orchestrator = RequestOrchestrator::new(Box::new(backend), Duration::from_secs(5));
        let req = request(&orchestrator, &["cup"]);
        assert!(matches!(
            orchestrator.localize(&req, || false).await,
            LocalizationOutcome::Failed(BackendError::Http(_))
        ));
    }
}

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use repcoach_core::coach::{CoachError, CoachModel, Language, MealImage};
use repcoach_core::gamification::GamificationSnapshot;
use repcoach_core::log_import::{WorkoutImportSummary, parse_workout_csv};
use repcoach_core::models::{
    AdminStats, Goal, Identity, MealScanRecord, NewGoal, NewPerformanceLogEntry, NewPlan,
    PerformanceLogEntry, Plan, ScanQuota, Tier, User,
};
use repcoach_core::service::{CoachService, weekly_report};
use repcoach_core::tool_state::ToolState;
use repcoach_core::weekly::{WeeklyReport, WeeklyStats};

const BODY_LIMIT: usize = 12 * 1024 * 1024; // 12 MB, room for a base64 photo

#[derive(Clone)]
struct AppState {
    service: Arc<Mutex<CoachService>>,
    coach: Arc<dyn CoachModel>,
}

impl AppState {
    fn service(&self) -> MutexGuard<'_, CoachService> {
        self.service
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct WeeklyQuery {
    lang: Option<String>,
}

#[derive(Deserialize)]
struct PerformanceQuery {
    days: Option<i64>,
}

#[derive(Deserialize)]
struct ImportQuery {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MealScanRequest {
    /// Base64 image bytes, optionally as a `data:` URI.
    image: String,
    mime_type: Option<String>,
    notes: Option<String>,
    language: Option<String>,
}

#[derive(Deserialize)]
struct SetTierRequest {
    tier: String,
}

#[derive(Serialize)]
struct MeResponse {
    #[serde(flatten)]
    user: User,
    quota: ScanQuota,
}

#[derive(Serialize)]
struct ResetResponse {
    removed: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
    Forbidden,
    QuotaExceeded(ScanQuota),
    Upstream(CoachError),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing session token".to_string(),
            ),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                "Admin privileges required".to_string(),
            ),
            Self::QuotaExceeded(quota) => (
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "Monthly meal scan limit reached ({} of {})",
                    quota.used,
                    quota.limit.unwrap_or(quota.used)
                ),
            ),
            Self::Upstream(err) => {
                warn!(error = %err, "AI coach request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "AI coach is unavailable".to_string(),
                )
            }
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<CoachError> for ApiError {
    fn from(err: CoachError) -> Self {
        Self::Upstream(err)
    }
}

fn bad_request(err: &anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err:#}"))
}

// --- Middleware ---

/// Resolve the bearer token to an [`Identity`]. Nothing else about the user
/// is cached on the request.
async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let identity = match token {
        Some(token) => state.service().authenticate(token),
        None => Ok(None),
    };

    match identity {
        Ok(Some(identity)) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Ok(None) => ApiError::Unauthorized.into_response(),
        Err(e) => ApiError::Internal(e).into_response(),
    }
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

fn current_user(service: &CoachService, identity: Identity) -> Result<User, ApiError> {
    service
        .user(identity.user_id)
        .context("database error")?
        .ok_or(ApiError::Unauthorized)
}

fn require_admin(service: &CoachService, identity: Identity) -> Result<User, ApiError> {
    let user = current_user(service, identity)?;
    if user.is_admin {
        Ok(user)
    } else {
        Err(ApiError::Forbidden)
    }
}

// --- Handlers: profile ---

async fn get_me(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<MeResponse>, ApiError> {
    let service = state.service();
    let user = current_user(&service, identity)?;
    let quota = service.scan_quota(user.id, Utc::now())?;
    Ok(Json(MeResponse { user, quota }))
}

// --- Handlers: tool state ---

async fn get_tool_state(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ToolState>, ApiError> {
    let tool_state = state.service().tool_state(identity.user_id, Utc::now())?;
    Ok(Json(tool_state))
}

/// Replaces the whole tool state. The body is read leniently: anything that
/// is not JSON is sanitized like any other bad input.
async fn put_tool_state(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    body: Bytes,
) -> Result<Json<ToolState>, ApiError> {
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let saved = state
        .service()
        .save_tool_state(identity.user_id, &payload, Utc::now())?;
    Ok(Json(saved))
}

// --- Handlers: derived metrics ---

async fn get_gamification(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<GamificationSnapshot>, ApiError> {
    let snapshot = state.service().gamification(identity.user_id, Utc::now())?;
    Ok(Json(snapshot))
}

async fn get_weekly_stats(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<WeeklyStats>, ApiError> {
    let stats = state.service().weekly_stats(identity.user_id, Utc::now())?;
    Ok(Json(stats))
}

async fn get_weekly_summary(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<WeeklyQuery>,
) -> Result<Json<WeeklyReport>, ApiError> {
    let language = Language::parse_lenient(query.lang.as_deref());
    let stats = state.service().weekly_stats(identity.user_id, Utc::now())?;
    let report = weekly_report(state.coach.as_ref(), stats, language).await?;
    Ok(Json(report))
}

// --- Handlers: plans ---

async fn create_plan(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<NewPlan>,
) -> Result<(StatusCode, Json<Plan>), ApiError> {
    req.validate().map_err(|e| bad_request(&e))?;
    let plan = state
        .service()
        .create_plan(identity.user_id, &req, Utc::now())
        .context("failed to insert plan")?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn list_plans(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Plan>>, ApiError> {
    Ok(Json(state.service().list_plans(identity.user_id)?))
}

async fn get_plan(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> Result<Json<Plan>, ApiError> {
    state
        .service()
        .get_plan(identity.user_id, id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Plan {id} not found")))
}

async fn delete_plan(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.service().delete_plan(identity.user_id, id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Plan {id} not found")))
    }
}

// --- Handlers: goals ---

async fn create_goal(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<NewGoal>,
) -> Result<(StatusCode, Json<Goal>), ApiError> {
    req.validate().map_err(|e| bad_request(&e))?;
    let goal = state
        .service()
        .create_goal(identity.user_id, &req, Utc::now())
        .context("failed to insert goal")?;
    Ok((StatusCode::CREATED, Json(goal)))
}

async fn list_goals(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Goal>>, ApiError> {
    Ok(Json(state.service().list_goals(identity.user_id)?))
}

fn set_goal_state(
    state: &AppState,
    identity: Identity,
    id: i64,
    completed: bool,
) -> Result<Json<Goal>, ApiError> {
    state
        .service()
        .set_goal_completed(identity.user_id, id, completed, Utc::now())?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Goal {id} not found")))
}

async fn complete_goal(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> Result<Json<Goal>, ApiError> {
    set_goal_state(&state, identity, id, true)
}

async fn reopen_goal(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> Result<Json<Goal>, ApiError> {
    set_goal_state(&state, identity, id, false)
}

async fn delete_goal(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.service().delete_goal(identity.user_id, id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Goal {id} not found")))
    }
}

// --- Handlers: performance log ---

async fn log_performance(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<NewPerformanceLogEntry>,
) -> Result<(StatusCode, Json<PerformanceLogEntry>), ApiError> {
    req.validate().map_err(|e| bad_request(&e))?;
    let entry = state
        .service()
        .log_performance(identity.user_id, &req, Utc::now())
        .context("failed to insert performance entry")?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_performance(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<PerformanceQuery>,
) -> Result<Json<Vec<PerformanceLogEntry>>, ApiError> {
    if query.days.is_some_and(|d| d <= 0) {
        return Err(ApiError::BadRequest(
            "days must be greater than 0".to_string(),
        ));
    }
    let entries = state
        .service()
        .list_performance(identity.user_id, query.days, Utc::now())?;
    Ok(Json(entries))
}

async fn delete_performance(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.service().delete_performance(identity.user_id, id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Performance entry {id} not found")))
    }
}

/// CSV body, one set per row.
async fn import_performance(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ImportQuery>,
    body: String,
) -> Result<Json<WorkoutImportSummary>, ApiError> {
    let rows = parse_workout_csv(body.as_bytes()).map_err(|e| bad_request(&e))?;
    let summary =
        state
            .service()
            .import_workout_rows(identity.user_id, &rows, query.dry_run, Utc::now())?;
    Ok(Json(summary))
}

// --- Handlers: meal scans ---

fn decode_meal_image(req: &MealScanRequest) -> Result<MealImage, ApiError> {
    let (uri_mime, payload) = match req.image.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest.split_once(',').ok_or_else(|| {
                ApiError::BadRequest("Malformed data URI for image".to_string())
            })?;
            (meta.strip_suffix(";base64").map(str::to_string), data)
        }
        None => (None, req.image.as_str()),
    };

    let mime_type = req
        .mime_type
        .clone()
        .or(uri_mime)
        .unwrap_or_else(|| "image/jpeg".to_string());
    if !mime_type.starts_with("image/") {
        return Err(ApiError::BadRequest(format!(
            "Unsupported image type '{mime_type}'"
        )));
    }

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::BadRequest(format!("Image is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("Image must not be empty".to_string()));
    }
    Ok(MealImage { bytes, mime_type })
}

/// Quota check, then the AI call, then persistence. The store is not locked
/// while the coach is working.
async fn create_meal_scan(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<MealScanRequest>,
) -> Result<(StatusCode, Json<MealScanRecord>), ApiError> {
    let image = decode_meal_image(&req)?;
    let language = Language::parse_lenient(req.language.as_deref());

    let quota = state.service().scan_quota(identity.user_id, Utc::now())?;
    if quota.exhausted() {
        return Err(ApiError::QuotaExceeded(quota));
    }

    let analysis = state
        .coach
        .analyze_meal(&image, req.notes.as_deref(), language)
        .await?;

    let record = state.service().record_meal_scan(
        identity.user_id,
        &image,
        analysis,
        req.notes.as_deref(),
        language,
        Utc::now(),
    )?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_meal_scans(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<MealScanRecord>>, ApiError> {
    Ok(Json(state.service().list_meal_scans(identity.user_id)?))
}

async fn delete_meal_scan(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.service().delete_meal_scan(identity.user_id, id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Meal scan {id} not found")))
    }
}

// --- Handlers: admin ---

async fn admin_list_users(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<User>>, ApiError> {
    let service = state.service();
    require_admin(&service, identity)?;
    Ok(Json(service.list_users()?))
}

async fn admin_set_tier(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<i64>,
    Json(req): Json<SetTierRequest>,
) -> Result<Json<User>, ApiError> {
    let tier = Tier::parse(&req.tier).map_err(|e| bad_request(&e))?;
    let service = state.service();
    let admin = require_admin(&service, identity)?;
    let user = service
        .set_user_tier(user_id, tier)?
        .ok_or_else(|| ApiError::NotFound(format!("User {user_id} not found")))?;
    info!(admin_id = admin.id, user_id, tier = tier.as_str(), "admin changed tier");
    Ok(Json(user))
}

async fn admin_reset_user_tool_state(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<i64>,
) -> Result<Json<ResetResponse>, ApiError> {
    let service = state.service();
    require_admin(&service, identity)?;
    let removed = usize::from(service.reset_tool_state(user_id)?);
    Ok(Json(ResetResponse { removed }))
}

async fn admin_reset_all_tool_states(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ResetResponse>, ApiError> {
    let service = state.service();
    let admin = require_admin(&service, identity)?;
    let removed = service.reset_all_tool_states()?;
    info!(admin_id = admin.id, removed, "admin reset all tool states");
    Ok(Json(ResetResponse { removed }))
}

async fn admin_stats(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<AdminStats>, ApiError> {
    let service = state.service();
    require_admin(&service, identity)?;
    Ok(Json(service.admin_stats()?))
}

// --- Router ---

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/me", get(get_me))
        .route("/api/tool-state", get(get_tool_state).put(put_tool_state))
        .route("/api/gamification", get(get_gamification))
        .route("/api/weekly-stats", get(get_weekly_stats))
        .route("/api/weekly-summary", get(get_weekly_summary))
        .route("/api/plans", post(create_plan).get(list_plans))
        .route("/api/plans/{id}", get(get_plan).delete(delete_plan))
        .route("/api/goals", post(create_goal).get(list_goals))
        .route("/api/goals/{id}", delete(delete_goal))
        .route("/api/goals/{id}/complete", post(complete_goal))
        .route("/api/goals/{id}/reopen", post(reopen_goal))
        .route(
            "/api/performance",
            post(log_performance).get(list_performance),
        )
        .route("/api/performance/import", post(import_performance))
        .route("/api/performance/{id}", delete(delete_performance))
        .route("/api/meal-scans", post(create_meal_scan).get(list_meal_scans))
        .route("/api/meal-scans/{id}", delete(delete_meal_scan))
        .route("/api/admin/users", get(admin_list_users))
        .route("/api/admin/users/{id}/tier", put(admin_set_tier))
        .route(
            "/api/admin/users/{id}/tool-state",
            delete(admin_reset_user_tool_state),
        )
        .route("/api/admin/tool-states", delete(admin_reset_all_tool_states))
        .route("/api/admin/stats", get(admin_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Server startup ---

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn start_server(
    service: CoachService,
    coach: Arc<dyn CoachModel>,
    port: u16,
    bind: &str,
) -> anyhow::Result<()> {
    let state = AppState {
        service: Arc::new(Mutex::new(service)),
        coach,
    };
    let app = build_router(state);

    if bind != "127.0.0.1" && bind != "localhost" {
        warn!(bind, "listening beyond localhost; serve behind a TLS-terminating proxy");
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    info!("Listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use repcoach_core::models::{Macros, MealAnalysis};
    use repcoach_core::service::ServiceSettings;
    use tower::ServiceExt;

    const USER_TOKEN: &str = "user-token-123";
    const ADMIN_TOKEN: &str = "admin-token-456";

    struct StubCoach {
        fail: bool,
    }

    #[async_trait]
    impl CoachModel for StubCoach {
        async fn analyze_meal(
            &self,
            _image: &MealImage,
            notes: Option<&str>,
            _language: Language,
        ) -> Result<MealAnalysis, CoachError> {
            if self.fail {
                return Err(CoachError::Transport("connection refused".to_string()));
            }
            Ok(MealAnalysis {
                total_calories: 550.0,
                macros: Macros {
                    protein_grams: 35.0,
                    carbs_grams: 50.0,
                    fat_grams: 15.0,
                },
                ingredients: vec![],
                confidence: 0.7,
                notes: notes.unwrap_or_default().to_string(),
            })
        }

        async fn summarize_week(
            &self,
            stats: &WeeklyStats,
            language: Language,
        ) -> Result<String, CoachError> {
            if self.fail {
                return Err(CoachError::Status {
                    status: 500,
                    body: "secret upstream detail".to_string(),
                });
            }
            Ok(format!("[{}] {} sessions", language.code(), stats.sessions))
        }
    }

    struct TestApp {
        router: Router,
        user_id: i64,
    }

    fn test_app_with(fail: bool, settings: ServiceSettings) -> TestApp {
        let service = CoachService::new_in_memory(settings).unwrap();
        let now = Utc::now();
        let user = service
            .create_user("athlete@example.com", Some("Athlete"), false, now)
            .unwrap();
        let admin = service
            .create_user("admin@example.com", None, true, now)
            .unwrap();
        service.issue_session(user.id, USER_TOKEN, now).unwrap();
        service.issue_session(admin.id, ADMIN_TOKEN, now).unwrap();

        let state = AppState {
            service: Arc::new(Mutex::new(service)),
            coach: Arc::new(StubCoach { fail }),
        };
        TestApp {
            router: build_router(state),
            user_id: user.id,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(false, ServiceSettings::default())
    }

    async fn send(
        app: &TestApp,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn auth_missing_token_returns_401() {
        let app = test_app();
        let (status, json) = send(&app, "GET", "/api/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Invalid or missing session token");
    }

    #[tokio::test]
    async fn auth_wrong_token_returns_401() {
        let app = test_app();
        let (status, _) = send(&app, "GET", "/api/me", Some("nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_reflects_current_tier() {
        let app = test_app();
        let (status, json) = send(&app, "GET", "/api/me", Some(USER_TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["email"], "athlete@example.com");
        assert_eq!(json["tier"], "free");
        assert_eq!(json["quota"]["limit"], 30);

        let uri = format!("/api/admin/users/{}/tier", app.user_id);
        let (status, json) = send(
            &app,
            "PUT",
            &uri,
            Some(ADMIN_TOKEN),
            Some(serde_json::json!({ "tier": "pro" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tier"], "pro");

        // Same session, fresh lookup.
        let (_, json) = send(&app, "GET", "/api/me", Some(USER_TOKEN), None).await;
        assert_eq!(json["tier"], "pro");
        assert!(json["quota"]["limit"].is_null());
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(
                axum::http::Request::get("/api/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = test_app();
        let big_body = vec![b'a'; BODY_LIMIT + 1];
        let response = app
            .router
            .clone()
            .oneshot(
                axum::http::Request::put("/api/tool-state")
                    .header("Authorization", format!("Bearer {USER_TOKEN}"))
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /var/lib/repcoach"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }

    #[tokio::test]
    async fn tool_state_defaults_then_round_trip() {
        let app = test_app();
        let (status, json) = send(&app, "GET", "/api/tool-state", Some(USER_TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["hydration"]["targetMl"], 2000);
        assert_eq!(json["boxing"]["phase"], "round");

        let payload = serde_json::json!({
            "hydration": { "targetMl": 2500, "consumedMl": 750 },
            "stopwatch": { "elapsedMs": 42000, "running": false },
            "boxing": { "roundLength": 120, "restLength": 30, "rounds": 5,
                        "currentRound": 2, "phase": "rest", "timeLeft": 12, "running": false }
        });
        let (status, _) = send(
            &app,
            "PUT",
            "/api/tool-state",
            Some(USER_TOKEN),
            Some(payload),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, json) = send(&app, "GET", "/api/tool-state", Some(USER_TOKEN), None).await;
        assert_eq!(json["hydration"]["consumedMl"], 750);
        assert_eq!(json["stopwatch"]["elapsedMs"], 42000);
        assert_eq!(json["boxing"]["currentRound"], 2);
        assert_eq!(json["boxing"]["phase"], "rest");
        assert_eq!(json["boxing"]["timeLeft"], 12);
    }

    #[tokio::test]
    async fn tool_state_put_clamps_and_never_rejects() {
        let app = test_app();
        let (status, json) = send(
            &app,
            "PUT",
            "/api/tool-state",
            Some(USER_TOKEN),
            Some(serde_json::json!({
                "stopwatch": { "elapsedMs": -5 },
                "boxing": { "rounds": 99 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stopwatch"]["elapsedMs"], 0);
        assert_eq!(json["boxing"]["rounds"], 20);

        let response = app
            .router
            .clone()
            .oneshot(
                axum::http::Request::put("/api/tool-state")
                    .header("Authorization", format!("Bearer {USER_TOKEN}"))
                    .body(Body::from("definitely not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn gamification_counts_plans_and_goals() {
        let app = test_app();
        let (status, plan) = send(
            &app,
            "POST",
            "/api/plans",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "kind": "workout", "title": "Push day" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(plan["kind"], "workout");

        let (_, goal) = send(
            &app,
            "POST",
            "/api/goals",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "title": "Bench 100kg" })),
        )
        .await;
        let uri = format!("/api/goals/{}/complete", goal["id"]);
        let (status, goal) = send(&app, "POST", &uri, Some(USER_TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(goal["completed"], true);

        let (status, json) = send(&app, "GET", "/api/gamification", Some(USER_TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["plansCreated"], 1);
        assert_eq!(json["goalsCompleted"], 1);
        assert_eq!(json["xp"], 20);
    }

    #[tokio::test]
    async fn plans_are_scoped_to_their_owner() {
        let app = test_app();
        let (_, plan) = send(
            &app,
            "POST",
            "/api/plans",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "kind": "meal", "title": "Cut", "body": "1800 kcal" })),
        )
        .await;
        let uri = format!("/api/plans/{}", plan["id"]);

        let (status, _) = send(&app, "GET", &uri, Some(ADMIN_TOKEN), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", &uri, Some(ADMIN_TOKEN), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", &uri, Some(USER_TOKEN), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &uri, Some(USER_TOKEN), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn blank_plan_title_is_bad_request() {
        let app = test_app();
        let (status, json) = send(
            &app,
            "POST",
            "/api/plans",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "kind": "workout", "title": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("title"));
    }

    #[tokio::test]
    async fn performance_log_feeds_weekly_summary() {
        let app = test_app();
        for (load, reps) in [(100.0, 5), (60.0, 5)] {
            let (status, _) = send(
                &app,
                "POST",
                "/api/performance",
                Some(USER_TOKEN),
                Some(serde_json::json!({ "exercise": "Squat", "load": load, "reps": reps })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, json) = send(&app, "GET", "/api/weekly-stats", Some(USER_TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessions"], 2);
        assert_eq!(json["currentVolume"], 800.0);

        let (status, json) = send(
            &app,
            "GET",
            "/api/weekly-summary?lang=fr",
            Some(USER_TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["summary"], "[fr] 2 sessions");
        assert_eq!(json["stats"]["currentVolume"], 800.0);

        let (_, json) = send(
            &app,
            "GET",
            "/api/weekly-summary?lang=klingon",
            Some(USER_TOKEN),
            None,
        )
        .await;
        assert_eq!(json["summary"], "[en] 2 sessions");
    }

    #[tokio::test]
    async fn invalid_performance_entry_is_bad_request() {
        let app = test_app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/performance",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "exercise": "Squat", "load": -1.0, "reps": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "GET",
            "/api/performance?days=0",
            Some(USER_TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn weekly_summary_failure_is_opaque_502() {
        let app = test_app_with(true, ServiceSettings::default());
        let (status, json) = send(
            &app,
            "GET",
            "/api/weekly-summary",
            Some(USER_TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"], "AI coach is unavailable");
        assert!(json.get("stats").is_none());
    }

    #[tokio::test]
    async fn import_endpoint_reports_bad_csv() {
        let app = test_app();
        let request = |body: &'static str, uri: &str| {
            axum::http::Request::post(uri)
                .header("Authorization", format!("Bearer {USER_TOKEN}"))
                .header("content-type", "text/csv")
                .body(Body::from(body))
                .unwrap()
        };

        let response = app
            .router
            .clone()
            .oneshot(request(
                "Date,Exercise Name,Weight,Reps\n2024-03-01,Squat,100,5\n",
                "/api/performance/import?dry_run=true",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let summary: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(summary["entries_imported"], 1);

        let response = app
            .router
            .clone()
            .oneshot(request("Exercise Name,Reps\nSquat,5\n", "/api/performance/import"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    fn scan_body() -> Value {
        serde_json::json!({
            "image": format!("data:image/png;base64,{}", STANDARD.encode(b"png-bytes")),
            "notes": "post-workout",
            "language": "es"
        })
    }

    #[tokio::test]
    async fn meal_scan_records_result_and_counts_toward_gamification() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServiceSettings {
            scan_dir: Some(dir.path().to_path_buf()),
            ..ServiceSettings::default()
        };
        let app = test_app_with(false, settings);

        let (status, json) = send(
            &app,
            "POST",
            "/api/meal-scans",
            Some(USER_TOKEN),
            Some(scan_body()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["result"]["totalCalories"], 550.0);
        assert_eq!(json["language"], "es");
        assert_eq!(json["userNotes"], "post-workout");
        let image_ref = json["imageRef"].as_str().unwrap();
        assert!(image_ref.ends_with(".png"));
        assert!(dir.path().join(image_ref).exists());

        let (_, json) = send(&app, "GET", "/api/gamification", Some(USER_TOKEN), None).await;
        assert_eq!(json["totalAnalyses"], 1);
        assert_eq!(json["streakDays"], 1);
    }

    #[tokio::test]
    async fn meal_scan_quota_exhausted_returns_429() {
        let settings = ServiceSettings {
            free_monthly_scans: 1,
            ..ServiceSettings::default()
        };
        let app = test_app_with(false, settings);
        let (status, _) = send(
            &app,
            "POST",
            "/api/meal-scans",
            Some(USER_TOKEN),
            Some(scan_body()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, json) = send(
            &app,
            "POST",
            "/api/meal-scans",
            Some(USER_TOKEN),
            Some(scan_body()),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(json["error"].as_str().unwrap().contains("1 of 1"));
    }

    #[tokio::test]
    async fn meal_scan_upstream_failure_persists_nothing() {
        let app = test_app_with(true, ServiceSettings::default());
        let (status, _) = send(
            &app,
            "POST",
            "/api/meal-scans",
            Some(USER_TOKEN),
            Some(scan_body()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (_, json) = send(&app, "GET", "/api/meal-scans", Some(USER_TOKEN), None).await;
        assert_eq!(json.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn meal_scan_rejects_bad_images() {
        let app = test_app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/meal-scans",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "image": "!!!not base64!!!" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/meal-scans",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "image": "aGVsbG8=", "mimeType": "text/plain" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_routes_require_admin() {
        let app = test_app();
        for (method, uri) in [
            ("GET", "/api/admin/users"),
            ("GET", "/api/admin/stats"),
            ("DELETE", "/api/admin/tool-states"),
        ] {
            let (status, json) = send(&app, method, uri, Some(USER_TOKEN), None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
            assert_eq!(json["error"], "Admin privileges required");
        }

        let (status, json) = send(&app, "GET", "/api/admin/users", Some(ADMIN_TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn admin_bulk_reset_restores_defaults() {
        let app = test_app();
        send(
            &app,
            "PUT",
            "/api/tool-state",
            Some(USER_TOKEN),
            Some(serde_json::json!({ "hydration": { "consumedMl": 900 } })),
        )
        .await;

        let (status, json) = send(
            &app,
            "DELETE",
            "/api/admin/tool-states",
            Some(ADMIN_TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], 1);

        let (_, json) = send(&app, "GET", "/api/tool-state", Some(USER_TOKEN), None).await;
        assert_eq!(json["hydration"]["consumedMl"], 0);

        let (_, stats) = send(&app, "GET", "/api/admin/stats", Some(ADMIN_TOKEN), None).await;
        assert_eq!(stats["users"], 2);
        assert_eq!(stats["toolStates"], 0);
    }

    #[tokio::test]
    async fn admin_set_tier_validates_input() {
        let app = test_app();
        let uri = format!("/api/admin/users/{}/tier", app.user_id);
        let (status, _) = send(
            &app,
            "PUT",
            &uri,
            Some(ADMIN_TOKEN),
            Some(serde_json::json!({ "tier": "platinum" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "PUT",
            "/api/admin/users/9999/tier",
            Some(ADMIN_TOKEN),
            Some(serde_json::json!({ "tier": "pro" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

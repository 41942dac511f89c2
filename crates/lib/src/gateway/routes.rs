//! `/api/*` REST routes. Each route resolves the caller's credential, re-issues the call
//! upstream, and answers with an `ApiEnvelope`.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};

use super::credentials::AUTH_COOKIE;
use super::protocol::{ApiEnvelope, ErrorCode, ErrorMapping};
use super::server::GatewayState;
use super::upstream::{UpstreamFailure, UpstreamResult};

const LOGIN_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(401, ErrorCode::InvalidCredentials)], ErrorCode::AuthenticationFailed);
const PASSWORD_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(400, ErrorCode::InvalidRequest)], ErrorCode::PasswordChangeFailed);
const SIGNUP_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(400, ErrorCode::BadRequest)], ErrorCode::SignupFailed);
const DASHBOARD_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(404, ErrorCode::StaffNotFound)], ErrorCode::DashboardFetchFailed);
const STAFF_LIST_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(404, ErrorCode::StaffNotFound)], ErrorCode::StaffFetchFailed);
const STAFF_ADD_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(409, ErrorCode::StaffExists)], ErrorCode::AddStaffFailed);
const STAFF_EDIT_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(404, ErrorCode::StaffNotFound)], ErrorCode::EditStaffFailed);
const PATIENT_LIST_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(404, ErrorCode::StaffNotFound)], ErrorCode::PatientsFetchFailed);
const PATIENT_ADD_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(409, ErrorCode::PatientExists)], ErrorCode::AddPatientFailed);
const PATIENT_EDIT_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(404, ErrorCode::PatientNotFound)], ErrorCode::EditPatientFailed);
const PATIENT_DELETE_ERRORS: ErrorMapping =
    ErrorMapping::new(&[(404, ErrorCode::PatientNotFound)], ErrorCode::DeletePatientFailed);
const CHAT_SESSION_ERRORS: ErrorMapping = ErrorMapping::always(ErrorCode::ChatSessionFailed);
const MESSAGE_ERRORS: ErrorMapping = ErrorMapping::always(ErrorCode::MessageSendFailed);
const CHEMO_ERRORS: ErrorMapping = ErrorMapping::always(ErrorCode::ChemoLogFailed);
const PASS_THROUGH_ERRORS: ErrorMapping = ErrorMapping::always(ErrorCode::UpstreamRequestFailed);
const BACKEND_ERRORS: ErrorMapping = ErrorMapping::always(ErrorCode::BackendError);

const DEFAULT_PAGE: &str = "1";
const DEFAULT_PAGE_SIZE: &str = "20";

type Params = Query<HashMap<String, String>>;

pub(crate) fn api_router() -> Router<GatewayState> {
    Router::new()
        .route("/api", get(api_info))
        .route("/api/health", get(health))
        .route("/api/login", post(login))
        .route("/api/complete-new-password", post(complete_new_password))
        .route("/api/signup", post(signup))
        .route("/api/logout", post(logout))
        .route("/api/chat/session/today", get(today_session))
        .route("/api/chat/session/new", post(new_session))
        .route("/api/chat/message", post(send_message))
        .route("/api/chat/chemo/log", post(log_chemo))
        .route("/api/chemo/log", post(log_chemo))
        .route("/api/dashboard", get(dashboard))
        .route("/api/staff", get(list_staff).post(add_staff))
        .route("/api/staff/:staff_uuid", patch(edit_staff))
        .route("/api/patients", get(list_patients).post(add_patient))
        .route(
            "/api/patients/:patient_uuid",
            patch(edit_patient).delete(delete_patient),
        )
        .route("/api/profile", get(profile))
        .route("/api/notes/:year/:month", get(list_notes))
        .route("/api/notes", post(create_note))
        .route("/api/notes/:note_id", patch(update_note).delete(delete_note))
        .route("/api/summaries/:year/:month", get(list_summaries))
        .route("/api/summaries/:summary_id", get(summary_detail))
        .route("/api/patient/update-consent", patch(update_consent))
}

/// Fallback for anything no route claimed.
pub(crate) async fn route_not_found(method: Method, uri: axum::http::Uri) -> ApiEnvelope {
    log::debug!("no route for {} {}", method, uri.path());
    ApiEnvelope::fail_with_details(
        404,
        ErrorCode::RouteNotFound,
        "API route not found",
        Some(json!({ "path": uri.path(), "method": method.as_str() })),
    )
}

/// Turn an upstream outcome into the gateway envelope.
fn envelope(result: UpstreamResult, errors: ErrorMapping) -> ApiEnvelope {
    match result {
        Ok(ok) => ApiEnvelope::ok(ok.status, ok.data),
        Err(failure) => failure_envelope(failure, errors),
    }
}

fn failure_envelope(failure: UpstreamFailure, errors: ErrorMapping) -> ApiEnvelope {
    ApiEnvelope::fail_with_details(
        failure.status,
        errors.code_for(failure.status),
        failure.message,
        failure.details,
    )
}

fn missing_credentials() -> ApiEnvelope {
    ApiEnvelope::fail(401, ErrorCode::MissingCredentials, "Authentication required")
}

/// Parse a JSON request body; an empty body is `{}`.
fn json_body(bytes: &Bytes) -> Result<Value, ApiEnvelope> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes).map_err(|e| {
        ApiEnvelope::fail(400, ErrorCode::InvalidRequest, format!("invalid JSON body: {}", e))
    })
}

fn text_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn forwarded_query(params: &HashMap<String, String>, keys: &[&'static str]) -> Vec<(&'static str, String)> {
    keys.iter()
        .filter_map(|k| params.get(*k).map(|v| (*k, v.clone())))
        .collect()
}

fn paging(params: &HashMap<String, String>) -> Vec<(&'static str, String)> {
    vec![
        ("page", params.get("page").cloned().unwrap_or_else(|| DEFAULT_PAGE.to_string())),
        (
            "page_size",
            params
                .get("page_size")
                .cloned()
                .unwrap_or_else(|| DEFAULT_PAGE_SIZE.to_string()),
        ),
    ]
}

/// Forward one authenticated call. Answers MISSING_CREDENTIALS without calling upstream when the
/// credential source resolves nothing.
async fn forward(
    state: &GatewayState,
    headers: &HeaderMap,
    method: Method,
    path: &str,
    query: &[(&'static str, String)],
    body: Option<&Value>,
    errors: ErrorMapping,
) -> ApiEnvelope {
    let Some(credential) = state.credentials.resolve(headers) else {
        log::warn!("{} {}: no credential from {} source", method, path, state.credentials.name());
        return missing_credentials();
    };
    let result = state
        .upstream
        .send(method, path, query, body, Some(&credential))
        .await;
    envelope(result, errors)
}

/// Forward an authenticated call whose JSON body comes from the client.
async fn forward_body(
    state: &GatewayState,
    headers: &HeaderMap,
    method: Method,
    path: &str,
    query: &[(&'static str, String)],
    bytes: &Bytes,
    errors: ErrorMapping,
) -> ApiEnvelope {
    match json_body(bytes) {
        Ok(body) => forward(state, headers, method, path, query, Some(&body), errors).await,
        Err(rejected) => rejected,
    }
}

/// `Set-Cookie` for the production auth cookie; `None` clears it.
fn auth_cookie(token: Option<&str>, max_age_secs: u64) -> String {
    match token {
        Some(token) => format!(
            "{}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
            AUTH_COOKIE, token, max_age_secs
        ),
        None => format!(
            "{}=; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=0",
            AUTH_COOKIE
        ),
    }
}

/// Attach the auth cookie in production when `tokens.access_token` is present.
fn with_session_cookie(state: &GatewayState, env: ApiEnvelope, tokens: Option<&Value>) -> Response {
    let access = tokens
        .and_then(|t| t.get("access_token"))
        .and_then(Value::as_str);
    let mut response = env.into_response();
    if !state.config.gateway.environment.is_production() {
        return response;
    }
    if let Some(token) = access {
        match HeaderValue::from_str(&auth_cookie(Some(token), state.config.gateway.cookie_max_age_secs)) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(_) => log::warn!("access token is not a valid cookie value; cookie not set"),
        }
    }
    response
}

async fn api_info(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "message": "OncoChat gateway API",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "environment": state.config.gateway.environment,
    }))
}

async fn health(State(state): State<GatewayState>) -> ApiEnvelope {
    let result = state.upstream.send(Method::GET, "/health", &[], None, None).await;
    envelope(result, BACKEND_ERRORS)
}

async fn login(State(state): State<GatewayState>, bytes: Bytes) -> Response {
    let body = match json_body(&bytes) {
        Ok(body) => body,
        Err(rejected) => return rejected.into_response(),
    };
    let (Some(email), Some(password)) = (text_field(&body, "email"), text_field(&body, "password")) else {
        log::warn!("login rejected: missing credentials");
        return ApiEnvelope::<Value>::fail(400, ErrorCode::MissingCredentials, "Email and password are required")
            .into_response();
    };

    log::info!("login for {} -> POST {}/auth/login", email, state.upstream.base_url());
    let upstream_body = json!({ "email": email, "password": password });
    let data = match state
        .upstream
        .send(Method::POST, "/auth/login", &[], Some(&upstream_body), None)
        .await
    {
        Ok(ok) => ok.data,
        Err(failure) => return failure_envelope(failure, LOGIN_ERRORS).into_response(),
    };

    let message = data.get("message").cloned().unwrap_or(Value::Null);
    let user_status = data.get("user_status").and_then(Value::as_str).unwrap_or_default();
    if !data.get("valid").and_then(Value::as_bool).unwrap_or(false) {
        log::warn!("login for {}: invalid credentials", email);
        let text = message.as_str().unwrap_or("Invalid email or password").to_string();
        return ApiEnvelope::<Value>::fail(401, ErrorCode::InvalidCredentials, text).into_response();
    }

    let session = data.get("session").cloned().unwrap_or(Value::Null);
    match user_status {
        "CONFIRMED" => {
            log::info!("login for {}: confirmed", email);
            let tokens = data.get("tokens").cloned().unwrap_or(Value::Null);
            let env = ApiEnvelope::ok(
                200,
                json!({ "user_status": user_status, "message": message, "tokens": tokens }),
            )
            .with_message("Login successful");
            with_session_cookie(&state, env, Some(&tokens))
        }
        "FORCE_CHANGE_PASSWORD" => {
            log::info!("login for {}: password change required", email);
            ApiEnvelope::ok(
                200,
                json!({
                    "user_status": user_status,
                    "message": message,
                    "session": session,
                    "requiresPasswordChange": true,
                }),
            )
            .with_message("Password change required")
            .into_response()
        }
        "CHALLENGE_REQUIRED" => {
            log::info!("login for {}: challenge required", email);
            ApiEnvelope::ok(
                200,
                json!({
                    "user_status": user_status,
                    "message": message,
                    "session": session,
                    "requiresChallenge": true,
                }),
            )
            .with_message("Additional authentication required")
            .into_response()
        }
        other => {
            log::error!("login for {}: unsupported user_status {:?}", email, other);
            ApiEnvelope::<Value>::fail(
                401,
                ErrorCode::AuthenticationFailed,
                format!("Unsupported login state: {}", other),
            )
            .into_response()
        }
    }
}

async fn complete_new_password(State(state): State<GatewayState>, bytes: Bytes) -> Response {
    let body = match json_body(&bytes) {
        Ok(body) => body,
        Err(rejected) => return rejected.into_response(),
    };
    let fields = (
        text_field(&body, "email"),
        text_field(&body, "new_password"),
        text_field(&body, "session"),
    );
    let (Some(email), Some(new_password), Some(session)) = fields else {
        return ApiEnvelope::<Value>::fail(
            400,
            ErrorCode::MissingFields,
            "Email, new password, and session are required",
        )
        .into_response();
    };

    let upstream_body = json!({ "email": email, "new_password": new_password, "session": session });
    match state
        .upstream
        .send(Method::POST, "/auth/complete-new-password", &[], Some(&upstream_body), None)
        .await
    {
        Ok(ok) => {
            log::info!("password changed for {}", email);
            let tokens = ok.data.get("tokens").cloned().unwrap_or(Value::Null);
            let env = ApiEnvelope::ok(
                200,
                json!({ "message": ok.data.get("message").cloned().unwrap_or(Value::Null), "tokens": tokens }),
            )
            .with_message("Password changed successfully");
            with_session_cookie(&state, env, Some(&tokens))
        }
        Err(failure) => failure_envelope(failure, PASSWORD_ERRORS).into_response(),
    }
}

async fn signup(State(state): State<GatewayState>, bytes: Bytes) -> ApiEnvelope {
    let body = match json_body(&bytes) {
        Ok(body) => body,
        Err(rejected) => return rejected,
    };
    let fields = (
        text_field(&body, "emailAddress"),
        text_field(&body, "firstName"),
        text_field(&body, "lastName"),
    );
    let (Some(email), Some(first_name), Some(last_name)) = fields else {
        return ApiEnvelope::fail(
            400,
            ErrorCode::MissingFields,
            "Email, first name, and last name are required",
        );
    };
    let upstream_body = json!({ "email": email, "first_name": first_name, "last_name": last_name });
    match state
        .upstream
        .send(Method::POST, "/auth/signup", &[], Some(&upstream_body), None)
        .await
    {
        Ok(ok) => {
            log::info!("signup for {}", email);
            ApiEnvelope::ok(
                201,
                json!({
                    "message": ok.data.get("message").cloned().unwrap_or(Value::Null),
                    "email": ok.data.get("email").cloned().unwrap_or(Value::Null),
                    "user_status": ok.data.get("user_status").cloned().unwrap_or(Value::Null),
                }),
            )
            .with_message("User created successfully")
        }
        Err(failure) => failure_envelope(failure, SIGNUP_ERRORS),
    }
}

async fn logout(State(state): State<GatewayState>) -> Response {
    let mut response = ApiEnvelope::ok(200, json!({ "message": "Logged out" })).into_response();
    if state.config.gateway.environment.is_production() {
        if let Ok(value) = HeaderValue::from_str(&auth_cookie(None, 0)) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

async fn today_session(State(state): State<GatewayState>, headers: HeaderMap, Query(params): Params) -> ApiEnvelope {
    let query = forwarded_query(&params, &["timezone"]);
    forward(&state, &headers, Method::GET, "/chat/session/today", &query, None, CHAT_SESSION_ERRORS).await
}

async fn new_session(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(params): Params,
    bytes: Bytes,
) -> ApiEnvelope {
    let query = forwarded_query(&params, &["timezone"]);
    forward_body(&state, &headers, Method::POST, "/chat/session/new", &query, &bytes, CHAT_SESSION_ERRORS).await
}

async fn send_message(State(state): State<GatewayState>, headers: HeaderMap, bytes: Bytes) -> ApiEnvelope {
    forward_body(&state, &headers, Method::POST, "/chat/message", &[], &bytes, MESSAGE_ERRORS).await
}

async fn log_chemo(State(state): State<GatewayState>, headers: HeaderMap, bytes: Bytes) -> ApiEnvelope {
    let env = forward_body(&state, &headers, Method::POST, "/chemo/log", &[], &bytes, CHEMO_ERRORS).await;
    if !env.success {
        log::warn!("chemo log failed with status {}", env.status);
    }
    env
}

async fn dashboard(State(state): State<GatewayState>, headers: HeaderMap, Query(params): Params) -> ApiEnvelope {
    let Some(staff_uuid) = params.get("staff_uuid").filter(|s| !s.trim().is_empty()) else {
        return ApiEnvelope::fail(400, ErrorCode::MissingStaffUuid, "staff_uuid parameter is required");
    };
    let mut query = vec![("staff_uuid", staff_uuid.clone())];
    query.extend(paging(&params));
    forward(&state, &headers, Method::GET, "/dashboard/get-dashboard-info", &query, None, DASHBOARD_ERRORS).await
}

async fn list_staff(State(state): State<GatewayState>, headers: HeaderMap, Query(params): Params) -> ApiEnvelope {
    forward(&state, &headers, Method::GET, "/staff/get-staff", &paging(&params), None, STAFF_LIST_ERRORS).await
}

async fn add_staff(State(state): State<GatewayState>, headers: HeaderMap, bytes: Bytes) -> ApiEnvelope {
    forward_body(&state, &headers, Method::POST, "/staff/add-staff", &[], &bytes, STAFF_ADD_ERRORS).await
}

async fn edit_staff(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(staff_uuid): Path<String>,
    bytes: Bytes,
) -> ApiEnvelope {
    let path = format!("/staff/edit-staff/{}", staff_uuid);
    forward_body(&state, &headers, Method::PATCH, &path, &[], &bytes, STAFF_EDIT_ERRORS).await
}

async fn list_patients(State(state): State<GatewayState>, headers: HeaderMap, Query(params): Params) -> ApiEnvelope {
    forward(&state, &headers, Method::GET, "/patients/get-patients", &paging(&params), None, PATIENT_LIST_ERRORS).await
}

async fn add_patient(State(state): State<GatewayState>, headers: HeaderMap, bytes: Bytes) -> ApiEnvelope {
    forward_body(&state, &headers, Method::POST, "/patients/add-patient", &[], &bytes, PATIENT_ADD_ERRORS).await
}

async fn edit_patient(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(patient_uuid): Path<String>,
    bytes: Bytes,
) -> ApiEnvelope {
    let path = format!("/patients/edit-patient/{}", patient_uuid);
    forward_body(&state, &headers, Method::PATCH, &path, &[], &bytes, PATIENT_EDIT_ERRORS).await
}

async fn delete_patient(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(patient_uuid): Path<String>,
) -> ApiEnvelope {
    let path = format!("/patients/delete-patient/{}", patient_uuid);
    forward(&state, &headers, Method::DELETE, &path, &[], None, PATIENT_DELETE_ERRORS).await
}

async fn profile(State(state): State<GatewayState>, headers: HeaderMap) -> ApiEnvelope {
    forward(&state, &headers, Method::GET, "/profile", &[], None, PASS_THROUGH_ERRORS).await
}

async fn list_notes(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((year, month)): Path<(String, String)>,
) -> ApiEnvelope {
    let path = format!("/diary/{}/{}", year, month);
    forward(&state, &headers, Method::GET, &path, &[], None, PASS_THROUGH_ERRORS).await
}

async fn create_note(State(state): State<GatewayState>, headers: HeaderMap, bytes: Bytes) -> ApiEnvelope {
    forward_body(&state, &headers, Method::POST, "/diary", &[], &bytes, PASS_THROUGH_ERRORS).await
}

async fn update_note(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(note_id): Path<String>,
    bytes: Bytes,
) -> ApiEnvelope {
    let path = format!("/diary/{}", note_id);
    forward_body(&state, &headers, Method::PATCH, &path, &[], &bytes, PASS_THROUGH_ERRORS).await
}

async fn delete_note(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(note_id): Path<String>,
) -> ApiEnvelope {
    let path = format!("/diary/{}", note_id);
    forward(&state, &headers, Method::DELETE, &path, &[], None, PASS_THROUGH_ERRORS).await
}

async fn list_summaries(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((year, month)): Path<(String, String)>,
) -> ApiEnvelope {
    let path = format!("/summaries/{}/{}", year, month);
    forward(&state, &headers, Method::GET, &path, &[], None, PASS_THROUGH_ERRORS).await
}

async fn summary_detail(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(summary_id): Path<String>,
) -> ApiEnvelope {
    let path = format!("/summaries/{}", summary_id);
    forward(&state, &headers, Method::GET, &path, &[], None, PASS_THROUGH_ERRORS).await
}

async fn update_consent(State(state): State<GatewayState>, headers: HeaderMap, bytes: Bytes) -> ApiEnvelope {
    forward_body(&state, &headers, Method::PATCH, "/patient/update-consent", &[], &bytes, BACKEND_ERRORS).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_empty_object_and_bad_json_is_rejected() {
        assert_eq!(json_body(&Bytes::from_static(b"  ")).unwrap(), json!({}));
        let rejected = json_body(&Bytes::from_static(b"{oops")).unwrap_err();
        assert_eq!(rejected.status, 400);
        assert_eq!(rejected.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn paging_defaults() {
        let mut params = HashMap::new();
        assert_eq!(
            paging(&params),
            vec![("page", "1".to_string()), ("page_size", "20".to_string())]
        );
        params.insert("page".to_string(), "3".to_string());
        assert_eq!(paging(&params)[0], ("page", "3".to_string()));
    }

    #[test]
    fn auth_cookie_set_and_clear() {
        assert_eq!(
            auth_cookie(Some("abc"), 3600),
            "authToken=abc; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=3600"
        );
        assert!(auth_cookie(None, 3600).ends_with("Max-Age=0"));
    }

    #[test]
    fn upstream_failure_keeps_status_and_maps_code() {
        let env = failure_envelope(
            UpstreamFailure {
                status: 409,
                message: "exists".into(),
                details: None,
            },
            PATIENT_ADD_ERRORS,
        );
        assert_eq!(env.status, 409);
        assert_eq!(env.error.unwrap().code, ErrorCode::PatientExists);
    }
}

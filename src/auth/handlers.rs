use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, instrument};

use crate::{
    auth::{
        dto::{
            ChangePasswordRequest, ForgotPasswordRequest, LoginRequest, RegisterRequest,
            UserResponse,
        },
        repo_types::User,
        services::AuthError,
    },
    session::{extract_session_id, set_cookie_header, RequestContext},
    state::AppState,
};

type ApiError = (StatusCode, String);

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/change-password", post(change_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn internal(e: anyhow::Error) -> ApiError {
    error!(error = %e, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".into())
}

/// `Set-Cookie` for whatever the service did to the session.
fn session_headers(state: &AppState, ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(change) = ctx.session.cookie_change() {
        match set_cookie_header(&state.config.session, change) {
            Ok(value) => {
                headers.insert(SET_COOKIE, value);
            }
            Err(e) => error!(error = %e, "invalid session cookie"),
        }
    }
    headers
}

fn user_response(
    state: &AppState,
    ctx: &RequestContext,
    result: Result<User, AuthError>,
) -> Result<(HeaderMap, Json<UserResponse>), ApiError> {
    match result {
        Ok(user) => Ok((session_headers(state, ctx), Json(UserResponse::user(user)))),
        Err(AuthError::Fields(errors)) => Ok((HeaderMap::new(), Json(UserResponse::errors(errors)))),
        Err(AuthError::Internal(e)) => Err(internal(e)),
    }
}

#[instrument(skip(state, ctx, payload))]
pub async fn register(
    State(state): State<AppState>,
    mut ctx: RequestContext,
    Json(payload): Json<RegisterRequest>,
) -> Result<(HeaderMap, Json<UserResponse>), ApiError> {
    let result = state.auth.register(&mut ctx, payload).await;
    user_response(&state, &ctx, result)
}

#[instrument(skip(state, ctx, payload))]
pub async fn login(
    State(state): State<AppState>,
    mut ctx: RequestContext,
    Json(payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<UserResponse>), ApiError> {
    let result = state
        .auth
        .login(&mut ctx, &payload.username_or_email, &payload.password)
        .await;
    user_response(&state, &ctx, result)
}

/// Never rejected: an unreachable cache is reported as `false`.
#[instrument(skip(state, headers))]
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> (HeaderMap, Json<bool>) {
    let id = extract_session_id(&headers, &state.config.session.cookie_name);
    let mut ctx = RequestContext {
        session: state.sessions.load_or_detached(id).await,
    };
    let ok = state.auth.logout(&mut ctx).await;
    (session_headers(&state, &ctx), Json(ok))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<bool>, ApiError> {
    let ok = state
        .auth
        .forgot_password(&payload.email)
        .await
        .map_err(internal)?;
    Ok(Json(ok))
}

#[instrument(skip(state, ctx, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    mut ctx: RequestContext,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<(HeaderMap, Json<UserResponse>), ApiError> {
    let result = state
        .auth
        .reset_password(&mut ctx, &payload.token, &payload.new_password)
        .await;
    user_response(&state, &ctx, result)
}

#[instrument(skip(state, ctx))]
pub async fn get_me(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<Option<User>>, ApiError> {
    let user = state.auth.me(&ctx).await.map_err(internal)?;
    Ok(Json(user))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header::COOKIE, Request},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        crate::app::build_app(AppState::fake())
    }

    fn post_json(uri: &str, body: Value, cookie: Option<&str>) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(c) = cookie {
            req = req.header(COOKIE, c);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn get_me_req(cookie: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().uri("/api/v1/me");
        if let Some(c) = cookie {
            req = req.header(COOKIE, c);
        }
        req.body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let cookie = res
            .headers()
            .get(SET_COOKIE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, cookie, body)
    }

    /// "qid=abc; Path=/; ..." -> "qid=abc"
    fn cookie_pair(set_cookie: &str) -> String {
        set_cookie.split(';').next().unwrap().to_string()
    }

    fn register_body() -> Value {
        json!({"username": "alice", "email": "alice@example.com", "password": "correctpw"})
    }

    #[tokio::test]
    async fn me_is_null_without_cookie() {
        let (status, cookie, body) = send(&app(), get_me_req(None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(cookie.is_none());
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn register_sets_cookie_that_me_accepts() {
        let app = app();
        let (status, cookie, body) =
            send(&app, post_json("/api/v1/auth/register", register_body(), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["username"], "alice");
        assert!(body["user"].get("password_hash").is_none());

        let set_cookie = cookie.expect("session cookie");
        assert!(set_cookie.contains("HttpOnly"));
        let (_, _, me) = send(&app, get_me_req(Some(&cookie_pair(&set_cookie)))).await;
        assert_eq!(me["email"], "alice@example.com");
    }

    #[tokio::test]
    async fn field_errors_are_data_without_cookie() {
        let app = app();
        send(&app, post_json("/api/v1/auth/register", register_body(), None)).await;

        let (status, cookie, body) = send(
            &app,
            post_json(
                "/api/v1/auth/login",
                json!({"usernameOrEmail": "alice", "password": "nope"}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(cookie.is_none());
        assert_eq!(body["errors"][0]["field"], "password");
        assert!(body.get("user").is_none());
    }

    #[tokio::test]
    async fn logout_clears_cookie_and_session() {
        let app = app();
        let (_, cookie, _) =
            send(&app, post_json("/api/v1/auth/register", register_body(), None)).await;
        let pair = cookie_pair(&cookie.unwrap());

        let (status, cleared, body) =
            send(&app, post_json("/api/v1/auth/logout", json!({}), Some(&pair))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Bool(true));
        assert!(cleared.unwrap().contains("Max-Age=0"));

        let (_, _, me) = send(&app, get_me_req(Some(&pair))).await;
        assert_eq!(me, Value::Null);
    }

    #[tokio::test]
    async fn logout_with_unreachable_cache_answers_false() {
        use std::sync::Arc;

        use crate::{
            auth::repo::testing::MemoryUserStore, cache::testing::DownCache,
            config::AppConfig, mail::LogMailer,
        };

        let config = Arc::new(AppConfig::for_tests());
        let db = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let app = crate::app::build_app(AppState::from_parts(
            db,
            config,
            Arc::new(DownCache),
            Arc::new(MemoryUserStore::default()),
            Arc::new(LogMailer),
        ));

        let (status, cookie, body) =
            send(&app, post_json("/api/v1/auth/logout", json!({}), Some("qid=abc"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Bool(false));
        assert!(cookie.is_none());
    }

    #[tokio::test]
    async fn logout_without_cookie_is_true() {
        let (status, _, body) = send(&app(), post_json("/api/v1/auth/logout", json!({}), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Bool(true));
    }

    #[tokio::test]
    async fn forgot_password_answers_true_for_unknown_email() {
        let (status, _, body) = send(
            &app(),
            post_json(
                "/api/v1/auth/forgot-password",
                json!({"email": "ghost@example.com"}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Bool(true));
    }

    #[tokio::test]
    async fn change_password_with_unknown_token() {
        let (_, cookie, body) = send(
            &app(),
            post_json(
                "/api/v1/auth/change-password",
                json!({"token": "missing", "newPassword": "newpw"}),
                None,
            ),
        )
        .await;
        assert!(cookie.is_none());
        assert_eq!(body["errors"][0]["message"], "token expired");
    }

    #[tokio::test]
    async fn health_is_ok() {
        let req = Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}

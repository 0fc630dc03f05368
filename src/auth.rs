//! 预览入口的 OAuth 登录、签名会话 Cookie 与访问拦截。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, Request, header};
use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};
use cookie::time::Duration as CookieDuration;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{GateSettings, OAUTH_STATE_COOKIE_NAME, SESSION_COOKIE_NAME};
use crate::error::ApiError;
use crate::guard::constant_time_eq;

pub const LOGIN_PATH: &str = "/login";
pub const LOGOUT_PATH: &str = "/logout";
pub const CALLBACK_PATH: &str = "/auth/google/callback";
pub const UPLOAD_PATH: &str = "/api/upload";

const OAUTH_SCOPE: &str = "openid email profile";
const STATE_TTL_MINUTES: i64 = 10;
const SESSION_TTL_DAYS: i64 = 7;
const PROVIDER_TIMEOUT_SECS: u64 = 10;

/// OAuth 配置与访问身份提供方所用的 HTTP 客户端。
#[derive(Debug)]
pub struct AuthGate {
    settings: GateSettings,
    client: reqwest::Client,
}

#[derive(Deserialize)]
pub(crate) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UserInfo {
    email: String,
    #[serde(default)]
    verified_email: Option<bool>,
}

impl AuthGate {
    pub fn new(settings: GateSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()?;
        Ok(Self { settings, client })
    }

    fn jar(&self, headers: &HeaderMap) -> SignedCookieJar {
        SignedCookieJar::from_headers(headers, self.settings.session_key.clone())
    }

    /// 有效且在白名单内的会话邮箱。
    pub fn session_email(&self, headers: &HeaderMap) -> Option<String> {
        let cookie = self.jar(headers).get(SESSION_COOKIE_NAME)?;
        let email = cookie.value();
        self.settings
            .is_email_allowed(email)
            .then(|| email.to_string())
    }

    fn authorize_url(&self, state: &str) -> String {
        let mut url = self.settings.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", OAUTH_SCOPE)
            .append_pair("state", state);
        url.into()
    }

    fn cookie(&self, name: &'static str, value: String, max_age: CookieDuration) -> Cookie<'static> {
        Cookie::build((name, value))
            .path("/")
            .http_only(true)
            .secure(self.settings.secure_cookies)
            .same_site(SameSite::Lax)
            .max_age(max_age)
            .build()
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, reqwest::Error> {
        self.client
            .post(self.settings.token_url.clone())
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("code", code),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("redirect_uri", self.settings.redirect_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<TokenResponse>()
            .await
    }

    async fn fetch_user(&self, access_token: &str) -> Result<UserInfo, reqwest::Error> {
        self.client
            .get(self.settings.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json::<UserInfo>()
            .await
    }
}

fn is_gate_exempt_path(path: &str) -> bool {
    matches!(path, LOGIN_PATH | LOGOUT_PATH | CALLBACK_PATH | UPLOAD_PATH)
}

/// 会话中间件：未登录的预览请求重定向到登录页。
pub async fn require_session(
    Extension(gate): Extension<Arc<AuthGate>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    if is_gate_exempt_path(req.uri().path()) || gate.session_email(req.headers()).is_some() {
        return next.run(req).await;
    }
    Redirect::temporary(LOGIN_PATH).into_response()
}

/// 登录：生成 state 并跳转到身份提供方。
pub async fn login(
    Extension(gate): Extension<Arc<AuthGate>>,
    headers: HeaderMap,
) -> (SignedCookieJar, Redirect) {
    let state = Uuid::new_v4().to_string();
    let redirect = Redirect::temporary(&gate.authorize_url(&state));
    let jar = gate.jar(&headers).add(gate.cookie(
        OAUTH_STATE_COOKIE_NAME,
        state,
        CookieDuration::minutes(STATE_TTL_MINUTES),
    ));
    (jar, redirect)
}

/// 回调：校验 state，换取令牌并检查邮箱白名单。
pub async fn callback(
    Extension(gate): Extension<Arc<AuthGate>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Result<(SignedCookieJar, Redirect), ApiError> {
    let jar = gate.jar(&headers);
    if let Some(error) = query.error {
        warn!(error, "identity provider returned an error");
        return Err(ApiError::Unauthorized("Login failed".into()));
    }

    let presented = query.state.unwrap_or_default();
    let state_matches = jar
        .get(OAUTH_STATE_COOKIE_NAME)
        .is_some_and(|cookie| constant_time_eq(cookie.value().as_bytes(), presented.as_bytes()));
    if presented.is_empty() || !state_matches {
        return Err(ApiError::Forbidden("Invalid login state".into()));
    }
    let code = query
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing authorization code".into()))?;

    let token = gate.exchange_code(&code).await.map_err(|err| {
        warn!(error = %err, "token exchange failed");
        ApiError::Internal("Failed to exchange token".into())
    })?;
    let user = gate.fetch_user(&token.access_token).await.map_err(|err| {
        warn!(error = %err, "user info request failed");
        ApiError::Internal("Failed to get user info".into())
    })?;

    if user.verified_email == Some(false) || !gate.settings.is_email_allowed(&user.email) {
        warn!(email = user.email, "login from unauthorized email");
        return Err(ApiError::Unauthorized("Unauthorized email".into()));
    }

    info!(email = user.email, "login succeeded");
    let jar = jar
        .remove(Cookie::build(OAUTH_STATE_COOKIE_NAME).path("/").build())
        .add(gate.cookie(
            SESSION_COOKIE_NAME,
            user.email.trim().to_ascii_lowercase(),
            CookieDuration::days(SESSION_TTL_DAYS),
        ));
    Ok((
        jar,
        Redirect::temporary(&gate.settings.post_login_redirect),
    ))
}

/// 登出：删除会话 Cookie。
pub async fn logout(
    Extension(gate): Extension<Arc<AuthGate>>,
    headers: HeaderMap,
) -> (SignedCookieJar, Redirect) {
    let jar = gate
        .jar(&headers)
        .remove(Cookie::build(SESSION_COOKIE_NAME).path("/").build());
    (jar, Redirect::temporary("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GOOGLE_AUTHORIZE_URL, GOOGLE_TOKEN_URL, GOOGLE_USERINFO_URL};
    use axum::http::{HeaderValue, StatusCode};
    use axum_extra::extract::cookie::Key;
    use reqwest::Url;

    fn gate() -> Arc<AuthGate> {
        let settings = GateSettings {
            client_id: "client-id".into(),
            client_secret: "client-secret".into(),
            redirect_url: "http://localhost:8080/auth/google/callback".into(),
            authorize_url: Url::parse(GOOGLE_AUTHORIZE_URL).expect("url"),
            token_url: Url::parse(GOOGLE_TOKEN_URL).expect("url"),
            userinfo_url: Url::parse(GOOGLE_USERINFO_URL).expect("url"),
            allowed_emails: vec!["writer@example.com".into()],
            session_key: Key::generate(),
            secure_cookies: false,
            post_login_redirect: "/".into(),
        };
        Arc::new(AuthGate::new(settings).expect("client"))
    }

    /// Request headers carrying the cookies a response set.
    fn cookies_from(response: &Response) -> HeaderMap {
        let cookies: Vec<String> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .map(str::to_string)
            .collect();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&cookies.join("; ")).expect("cookie header"),
        );
        headers
    }

    fn session_headers(gate: &AuthGate, email: &str) -> HeaderMap {
        let jar = gate.jar(&HeaderMap::new()).add(gate.cookie(
            SESSION_COOKIE_NAME,
            email.to_string(),
            CookieDuration::days(1),
        ));
        cookies_from(&(jar, ()).into_response())
    }

    #[test]
    fn upload_and_login_routes_are_exempt() {
        assert!(is_gate_exempt_path("/api/upload"));
        assert!(is_gate_exempt_path("/login"));
        assert!(is_gate_exempt_path("/auth/google/callback"));
        assert!(!is_gate_exempt_path("/"));
        assert!(!is_gate_exempt_path("/posts/hello/"));
    }

    #[test]
    fn signed_session_for_allowed_email_is_accepted() {
        let gate = gate();
        let headers = session_headers(&gate, "writer@example.com");
        assert_eq!(
            gate.session_email(&headers).as_deref(),
            Some("writer@example.com")
        );
    }

    #[test]
    fn session_for_other_email_is_rejected() {
        let gate = gate();
        let headers = session_headers(&gate, "intruder@example.com");
        assert!(gate.session_email(&headers).is_none());
    }

    #[test]
    fn unsigned_session_cookie_is_rejected() {
        let gate = gate();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("auth-session=writer@example.com"),
        );
        assert!(gate.session_email(&headers).is_none());
    }

    #[tokio::test]
    async fn login_redirects_with_state_cookie() {
        let gate = gate();
        let response = login(Extension(gate.clone()), HeaderMap::new())
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("location");
        let url = Url::parse(location).expect("authorize url");
        assert!(location.starts_with(GOOGLE_AUTHORIZE_URL));
        let state = url
            .query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .expect("state param");

        let cookie_headers = cookies_from(&response);
        let jar = gate.jar(&cookie_headers);
        assert_eq!(
            jar.get(OAUTH_STATE_COOKIE_NAME).map(|c| c.value().to_string()),
            Some(state)
        );
    }

    #[tokio::test]
    async fn callback_rejects_mismatched_state() {
        let gate = gate();
        let login_response = login(Extension(gate.clone()), HeaderMap::new())
            .await
            .into_response();
        let headers = cookies_from(&login_response);

        let result = callback(
            Extension(gate),
            Query(CallbackQuery {
                code: Some("code".into()),
                state: Some("forged".into()),
                error: None,
            }),
            headers,
        )
        .await;

        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn callback_without_state_cookie_is_rejected() {
        let result = callback(
            Extension(gate()),
            Query(CallbackQuery {
                code: Some("code".into()),
                state: Some("anything".into()),
                error: None,
            }),
            HeaderMap::new(),
        )
        .await;

        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn callback_reports_provider_error() {
        let result = callback(
            Extension(gate()),
            Query(CallbackQuery {
                code: None,
                state: None,
                error: Some("access_denied".into()),
            }),
            HeaderMap::new(),
        )
        .await;

        assert!(matches!(result, Err(ApiError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn logout_clears_session_cookie() {
        let gate = gate();
        let headers = session_headers(&gate, "writer@example.com");
        let response = logout(Extension(gate), headers).await.into_response();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let cleared = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.starts_with("auth-session=") && value.contains("Max-Age=0"));
        assert!(cleared);
    }

    fn gated_router(gate: Arc<AuthGate>) -> axum::Router {
        use axum::routing::{any, get};

        axum::Router::new()
            .route("/", get(|| async { "preview" }))
            .route(UPLOAD_PATH, any(|| async { "upload" }))
            .layer(middleware::from_fn(require_session))
            .layer(Extension(gate))
    }

    async fn send(gate: &Arc<AuthGate>, path: &str, headers: HeaderMap) -> Response {
        use tower::ServiceExt;

        let mut request = Request::builder()
            .uri(path)
            .body(AxumBody::empty())
            .expect("request");
        *request.headers_mut() = headers;
        gated_router(gate.clone())
            .oneshot(request)
            .await
            .expect("response")
    }

    #[tokio::test]
    async fn middleware_redirects_anonymous_preview_requests() {
        let gate = gate();
        let response = send(&gate, "/", HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], LOGIN_PATH);
    }

    #[tokio::test]
    async fn middleware_lets_upload_through_without_session() {
        let gate = gate();
        let response = send(&gate, UPLOAD_PATH, HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn middleware_admits_allowed_session_only() {
        let gate = gate();
        let allowed = session_headers(&gate, "writer@example.com");
        let response = send(&gate, "/", allowed).await;
        assert_eq!(response.status(), StatusCode::OK);

        let other = session_headers(&gate, "intruder@example.com");
        let response = send(&gate, "/", other).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    }
}


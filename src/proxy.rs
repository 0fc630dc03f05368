//! 反向代理：把已登录的请求转发到静态站点开发服务器。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, Request, Uri, header};
use axum::response::Response;
use http_body_util::BodyExt;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ProxySettings;
use crate::error::ApiError;

const BACKEND_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
pub struct ReverseProxy {
    backend: Url,
    client: reqwest::Client,
}

impl ReverseProxy {
    pub fn new(settings: ProxySettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(BACKEND_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            backend: settings.backend,
            client,
        })
    }

    pub fn backend(&self) -> &Url {
        &self.backend
    }

    /// 计算后端地址，保留后端自身的路径前缀。
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.backend.clone();
        let prefix = self.backend.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{}", uri.path()));
        url.set_query(uri.query());
        url
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove(header::HOST);
}

/// 转发请求并原样返回后端的状态码、响应头与响应体。
pub async fn forward(
    Extension(proxy): Extension<Arc<ReverseProxy>>,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let url = proxy.target_url(&parts.uri);
    let body = reqwest::Body::wrap_stream(body.into_data_stream());

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    let upstream = proxy
        .client
        .request(parts.method, url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|err| {
            warn!(url = %url, error = %err, "proxy request failed");
            ApiError::BadGateway("Failed to reach backend".into())
        })?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    let mut response = Response::new(AxumBody::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

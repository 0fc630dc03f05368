//! 统一的错误类型与转换。

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::fmt;

/// 预览入口与反向代理返回的错误。
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg).into_response(),
            ApiError::Internal(msg) => {
                let mut response = (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response();
                response
                    .headers_mut()
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
                response
            }
        }
    }
}

/// 请求级上传错误，出现即结束请求。
#[derive(Debug)]
pub enum UploadError {
    Unauthorized,
    MethodNotAllowed,
    RequestTooLarge,
    TooManyOrNoFiles { max: usize },
    /// 暂存目录无法创建或写入。
    Spool(std::io::Error),
}

impl UploadError {
    /// 可返回给客户端的提示信息。
    pub fn client_message(&self) -> String {
        match self {
            UploadError::Unauthorized => "Unauthorized".into(),
            UploadError::MethodNotAllowed => "Method not allowed".into(),
            UploadError::RequestTooLarge => "Request too large or invalid".into(),
            UploadError::TooManyOrNoFiles { max } => format!("Must provide 1-{max} images"),
            UploadError::Spool(_) => "Upload failed".into(),
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Spool(err) => write!(f, "spool failure: {err}"),
            other => f.write_str(&other.client_message()),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<multer::Error> for UploadError {
    fn from(_: multer::Error) -> Self {
        UploadError::RequestTooLarge
    }
}

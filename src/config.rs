//! CLI arguments, environment configuration and the validated settings built from them.

use axum_extra::extract::cookie::Key;
use clap::Parser;
use reqwest::Url;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::guard::AccessGuard;

pub const MIN_SECRET_LEN: usize = 32;
pub const MIN_SESSION_KEY_LEN: usize = 64;
pub const DEFAULT_IMAGE_DIR: &str = "content/images/posts";
pub const DEFAULT_PUBLIC_PREFIX: &str = "/images/posts";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 10;
pub const DEFAULT_UPLOAD_FIELD: &str = "images";
pub const DEFAULT_REJECT_DELAY_MS: u64 = 1000;
pub const DEFAULT_PROXY_BACKEND: &str = "http://localhost:1313";
pub const SESSION_COOKIE_NAME: &str = "auth-session";
pub const OAUTH_STATE_COOKIE_NAME: &str = "oauth-state";
pub const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// 命令行参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "blog-media", version, about = "Blog media upload and preview server")]
pub struct Args {
    #[arg(
        long,
        env = "BLOG_UPLOAD_SECRET",
        hide_env_values = true,
        help = "Shared secret expected in the X-API-Key header (min 32 chars)"
    )]
    pub upload_secret: Option<String>,
    #[arg(
        short = 'i',
        long,
        env = "BLOG_IMAGE_DIR",
        default_value = DEFAULT_IMAGE_DIR,
        help = "Directory receiving uploaded media"
    )]
    pub image_dir: String,
    #[arg(
        long,
        env = "BLOG_PUBLIC_PREFIX",
        default_value = DEFAULT_PUBLIC_PREFIX,
        help = "URL prefix under which stored media is served"
    )]
    pub public_prefix: String,
    #[arg(
        long,
        env = "BLOG_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single uploaded file in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "BLOG_MAX_FILES",
        default_value_t = DEFAULT_MAX_FILES,
        help = "Max number of files per upload request"
    )]
    pub max_files: usize,
    #[arg(
        long,
        env = "BLOG_UPLOAD_FIELD",
        default_value = DEFAULT_UPLOAD_FIELD,
        help = "Multipart field carrying the files"
    )]
    pub upload_field: String,
    #[arg(
        long,
        env = "BLOG_REJECT_DELAY_MS",
        default_value_t = DEFAULT_REJECT_DELAY_MS,
        help = "Delay applied before answering a rejected credential"
    )]
    pub reject_delay_ms: u64,
    #[arg(long, env = "BLOG_POSTS_DIR", help = "Directory for generated Hugo posts")]
    pub posts_dir: Option<String>,
    #[arg(long, env = "BLOG_SPOOL_DIR", help = "Directory for per-request upload spooling")]
    pub spool_dir: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "BLOG_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "BLOG_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "BLOG_OAUTH_CLIENT_ID", help = "OAuth client id (enables the preview gate)")]
    pub oauth_client_id: Option<String>,
    #[arg(
        long,
        env = "BLOG_OAUTH_CLIENT_SECRET",
        hide_env_values = true,
        help = "OAuth client secret"
    )]
    pub oauth_client_secret: Option<String>,
    #[arg(long, env = "BLOG_OAUTH_REDIRECT_URL", help = "OAuth callback URL")]
    pub oauth_redirect_url: Option<String>,
    #[arg(
        long,
        env = "BLOG_OAUTH_AUTHORIZE_URL",
        default_value = GOOGLE_AUTHORIZE_URL,
        help = "Identity provider authorize endpoint"
    )]
    pub oauth_authorize_url: String,
    #[arg(
        long,
        env = "BLOG_OAUTH_TOKEN_URL",
        default_value = GOOGLE_TOKEN_URL,
        help = "Identity provider token endpoint"
    )]
    pub oauth_token_url: String,
    #[arg(
        long,
        env = "BLOG_OAUTH_USERINFO_URL",
        default_value = GOOGLE_USERINFO_URL,
        help = "Identity provider user info endpoint"
    )]
    pub oauth_userinfo_url: String,
    #[arg(
        long,
        env = "BLOG_ALLOWED_EMAILS",
        help = "Comma separated emails allowed through the preview gate"
    )]
    pub allowed_emails: Option<String>,
    #[arg(
        long,
        env = "BLOG_SESSION_KEY",
        hide_env_values = true,
        help = "Session cookie signing key (min 64 bytes, random if unset)"
    )]
    pub session_key: Option<String>,
    #[arg(
        long,
        env = "BLOG_SECURE_COOKIES",
        default_value_t = false,
        help = "Mark session cookies as Secure"
    )]
    pub secure_cookies: bool,
    #[arg(
        long,
        env = "BLOG_POST_LOGIN_REDIRECT",
        default_value = "/",
        help = "Where to send the browser after a successful login"
    )]
    pub post_login_redirect: String,
    #[arg(
        long,
        env = "BLOG_PROXY_BACKEND",
        default_value = DEFAULT_PROXY_BACKEND,
        help = "Static site dev server behind the preview gate"
    )]
    pub proxy_backend: String,
}

/// 上传流程的限制与目录。
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub image_dir: PathBuf,
    pub public_prefix: String,
    pub max_file_size: u64,
    pub max_files: usize,
    pub field_name: String,
    pub posts_dir: Option<PathBuf>,
    pub spool_dir: Option<PathBuf>,
}

impl UploadSettings {
    /// 整个请求体的硬上限。
    pub fn body_ceiling(&self) -> u64 {
        self.max_file_size.saturating_mul(self.max_files as u64)
    }
}

/// 预览入口的 OAuth 配置，仅在设置了 client id 时存在。
#[derive(Clone)]
pub struct GateSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub authorize_url: Url,
    pub token_url: Url,
    pub userinfo_url: Url,
    pub allowed_emails: Vec<String>,
    pub session_key: Key,
    pub secure_cookies: bool,
    pub post_login_redirect: String,
}

impl fmt::Debug for GateSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateSettings")
            .field("client_id", &self.client_id)
            .field("redirect_url", &self.redirect_url)
            .field("allowed_emails", &self.allowed_emails)
            .finish_non_exhaustive()
    }
}

impl GateSettings {
    pub fn is_email_allowed(&self, email: &str) -> bool {
        let email = email.trim().to_ascii_lowercase();
        self.allowed_emails.iter().any(|allowed| *allowed == email)
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub backend: Url,
}

/// 启动时构建一次的只读配置。
#[derive(Debug)]
pub struct Settings {
    pub bind: SocketAddr,
    pub guard: AccessGuard,
    pub upload: UploadSettings,
    pub gate: Option<GateSettings>,
    pub proxy: ProxySettings,
}

#[derive(Debug)]
pub enum ConfigError {
    SecretMissing,
    SecretTooShort(usize),
    InvalidLimit(&'static str),
    InvalidAddress(String),
    InvalidUrl(&'static str, String),
    GateIncomplete(&'static str),
    SessionKeyTooShort,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::SecretMissing => write!(f, "upload secret is not configured"),
            ConfigError::SecretTooShort(len) => write!(
                f,
                "upload secret must be at least {MIN_SECRET_LEN} characters (got {len})"
            ),
            ConfigError::InvalidLimit(name) => write!(f, "{name} must be greater than zero"),
            ConfigError::InvalidAddress(err) => write!(f, "invalid bind address: {err}"),
            ConfigError::InvalidUrl(name, err) => write!(f, "invalid {name}: {err}"),
            ConfigError::GateIncomplete(name) => {
                write!(f, "oauth client id is set but {name} is missing")
            }
            ConfigError::SessionKeyTooShort => write!(
                f,
                "session key must be at least {MIN_SESSION_KEY_LEN} bytes"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for std::io::Error {
    fn from(err: ConfigError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string())
    }
}

/// 加载 `.env`（若存在）并解析命令行。
pub fn load_args() -> Args {
    if let Err(err) = dotenvy::dotenv()
        && !err.not_found()
    {
        warn!(error = %err, "failed to load .env file");
    }
    Args::parse()
}

impl Settings {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let secret = args
            .upload_secret
            .filter(|secret| !secret.is_empty())
            .ok_or(ConfigError::SecretMissing)?;
        let secret_len = secret.chars().count();
        if secret_len < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort(secret_len));
        }
        if args.max_file_size == 0 {
            return Err(ConfigError::InvalidLimit("max file size"));
        }
        if args.max_files == 0 {
            return Err(ConfigError::InvalidLimit("max files"));
        }

        let host = args
            .host
            .parse::<IpAddr>()
            .map_err(|err| ConfigError::InvalidAddress(err.to_string()))?;

        let upload = UploadSettings {
            image_dir: PathBuf::from(args.image_dir),
            public_prefix: args.public_prefix.trim_end_matches('/').to_string(),
            max_file_size: args.max_file_size,
            max_files: args.max_files,
            field_name: args.upload_field,
            posts_dir: args.posts_dir.map(PathBuf::from),
            spool_dir: args.spool_dir.map(PathBuf::from),
        };

        let gate = match args.oauth_client_id.filter(|id| !id.is_empty()) {
            Some(client_id) => Some(GateSettings {
                client_id,
                client_secret: args
                    .oauth_client_secret
                    .ok_or(ConfigError::GateIncomplete("client secret"))?,
                redirect_url: args
                    .oauth_redirect_url
                    .ok_or(ConfigError::GateIncomplete("redirect url"))?,
                authorize_url: parse_url("authorize url", &args.oauth_authorize_url)?,
                token_url: parse_url("token url", &args.oauth_token_url)?,
                userinfo_url: parse_url("userinfo url", &args.oauth_userinfo_url)?,
                allowed_emails: parse_email_list(args.allowed_emails.as_deref()),
                session_key: session_key(args.session_key.as_deref())?,
                secure_cookies: args.secure_cookies,
                post_login_redirect: args.post_login_redirect,
            }),
            None => None,
        };

        Ok(Self {
            bind: SocketAddr::new(host, args.port),
            guard: AccessGuard::new(secret, Duration::from_millis(args.reject_delay_ms)),
            upload,
            gate,
            proxy: ProxySettings {
                backend: parse_url("proxy backend", &args.proxy_backend)?,
            },
        })
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::InvalidUrl(name, err.to_string()))
}

fn parse_email_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|email| email.trim().to_ascii_lowercase())
        .filter(|email| !email.is_empty())
        .collect()
}

fn session_key(value: Option<&str>) -> Result<Key, ConfigError> {
    match value {
        Some(raw) => Key::try_from(raw.as_bytes()).map_err(|_| ConfigError::SessionKeyTooShort),
        None => {
            warn!("no session key configured, sessions will not survive a restart");
            Ok(Key::generate())
        }
    }
}

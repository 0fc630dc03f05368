//! Blog media server binary.
//!
//! Serves the authenticated media upload endpoint and, when an OAuth client is
//! configured, a login-gated reverse proxy in front of the static site's dev
//! server. The main entry point loads configuration once, prepares the media
//! directories, builds the Axum router and runs until a shutdown signal.

mod auth;
mod config;
mod error;
mod guard;
mod http;
mod logging;
mod post;
mod proxy;
mod sanitize;
mod storage;
mod upload;
mod validate;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{any, get};
use axum::{Router, middleware};
use axum_server::Handle;
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::{AuthGate, CALLBACK_PATH, LOGIN_PATH, LOGOUT_PATH, UPLOAD_PATH};
use crate::config::Settings;
use crate::proxy::ReverseProxy;
use crate::storage::{Storage, create_dir_secure};
use crate::upload::UploadService;

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = config::load_args();
    let Settings {
        bind,
        guard,
        upload,
        gate,
        proxy,
    } = Settings::from_args(args)?;

    let storage = Storage::new(upload.image_dir.clone(), upload.public_prefix.clone());
    storage.ensure_root().await?;
    let posts = match &upload.posts_dir {
        Some(dir) => {
            create_dir_secure(dir).await?;
            Some(Storage::new(dir.clone(), "/posts"))
        }
        None => None,
    };
    info!(
        image_dir = ?upload.image_dir,
        max_file_size = upload.max_file_size,
        max_files = upload.max_files,
        "upload endpoint ready"
    );
    let upload_service = Arc::new(UploadService::new(
        guard,
        upload,
        storage,
        posts,
        Local::now,
    ));

    let mut app = Router::new().route(
        UPLOAD_PATH,
        any(upload::upload_media).layer(DefaultBodyLimit::disable()),
    );

    match gate {
        Some(gate_settings) => {
            let gate = Arc::new(AuthGate::new(gate_settings).map_err(std::io::Error::other)?);
            let reverse_proxy = Arc::new(ReverseProxy::new(proxy).map_err(std::io::Error::other)?);
            info!(backend = %reverse_proxy.backend(), "preview gate enabled");
            app = app
                .route(LOGIN_PATH, get(auth::login))
                .route(LOGOUT_PATH, get(auth::logout))
                .route(CALLBACK_PATH, get(auth::callback))
                .fallback(proxy::forward)
                .layer(middleware::from_fn(auth::require_session))
                .layer(Extension(gate))
                .layer(Extension(reverse_proxy));
        }
        None => info!("no oauth client configured, preview gate disabled"),
    }

    let app = app
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = http::client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(upload_service));

    let handle = Handle::new();
    info!("Starting HTTP server at {}", bind);
    let server = axum_server::bind(bind)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

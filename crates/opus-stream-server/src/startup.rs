//! Actix server startup + app wiring.
//!
//! Builds the streamer, routes, middleware and OpenAPI endpoints, and runs the
//! graceful shutdown sequence on Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use actix_files::Files;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use actix_web::http::{Method, StatusCode};
use actix_web::{App, Error, HttpServer, web};
use anyhow::{Context, Result};
use futures_util::future::{LocalBoxFuture, Ready, ok};
use opus_stream_core::Streamer;
use opus_stream_core::transcoder::FfmpegTranscoder;
use tokio_util::sync::CancellationToken;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api;
use crate::config;
use crate::openapi;
use crate::state::AppState;

/// Build the streamer and run the HTTP server until shutdown completes.
pub(crate) async fn run(args: crate::Args) -> Result<()> {
    let cfg = load_config(args.config.as_ref())?;
    let bind = match args.bind {
        Some(addr) => addr,
        None => config::bind_from_config(&cfg)?,
    };
    let asset = args.asset.unwrap_or_else(|| config::asset_from_config(&cfg));
    let static_dir = args
        .static_dir
        .unwrap_or_else(|| config::static_dir_from_config(&cfg));
    let grace = config::shutdown_grace_from_config(&cfg);
    let (program, params) = config::transcoder_from_config(&cfg);
    let stream = config::stream_from_config(&cfg)?;
    let admission = config::admission_from_config(&cfg)?;

    tracing::info!(
        bind = %bind,
        asset = %asset.display(),
        transcoder = %program.display(),
        codec = %params.codec,
        format = %params.format,
        packet_size = stream.packet_size,
        channel_capacity = stream.channel_capacity,
        write_timeout_ms = stream.write_timeout.as_millis() as u64,
        admission_interval_ms = admission.interval.as_millis() as u64,
        admission_burst = admission.burst,
        "starting opus-stream-server"
    );
    if !asset.exists() {
        tracing::warn!(asset = %asset.display(), "asset not found; sessions will fail until it exists");
    }
    let static_root = static_dir.is_dir().then(|| static_dir.clone());
    match static_root.as_ref() {
        Some(dir) => tracing::info!(path = %dir.display(), "static files enabled"),
        None => tracing::info!(path = %static_dir.display(), "static files disabled (directory not found)"),
    }

    let streamer = Arc::new(Streamer::new(
        Arc::new(FfmpegTranscoder::new(program)),
        params,
        stream,
        &admission,
    ));
    let state = web::Data::new(AppState::new(
        streamer.clone(),
        asset.to_string_lossy().into_owned(),
    ));

    let server = HttpServer::new(move || {
        let mut app = App::new()
            .app_data(state.clone())
            .wrap(RequestLog)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-doc/openapi.json", openapi::ApiDoc::openapi()),
            )
            .service(api::health_check)
            .service(api::play_socket)
            .service(api::sessions_list)
            .service(api::sessions_close);

        if let Some(dir) = static_root.clone() {
            app = app.service(Files::new("/", dir).index_file("index.html"));
        }

        app
    })
    .disable_signals()
    .shutdown_timeout(grace.as_secs() + 2)
    .bind(bind)
    .with_context(|| format!("bind {bind}"))?
    .run();

    let stop = CancellationToken::new();
    setup_shutdown(stop.clone())?;
    let handle = server.handle();
    actix_web::rt::spawn(async move {
        stop.cancelled().await;
        tracing::info!(grace_ms = grace.as_millis() as u64, "shutdown requested");
        let stopped = handle.stop(true);
        streamer.shutdown(grace).await;
        stopped.await;
    });

    tracing::info!("listening on ws://{bind}");
    server.await.context("http server")?;
    tracing::info!("server stopped");
    Ok(())
}

/// Cancel `stop` on the first Ctrl+C; exit immediately on the second.
fn setup_shutdown(stop: CancellationToken) -> Result<()> {
    ctrlc::set_handler(move || {
        if stop.is_cancelled() {
            tracing::warn!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
        stop.cancel();
    })
    .context("install Ctrl+C handler")
}

/// Load server config from `--config`, `config.toml` next to the binary, or defaults.
fn load_config(path: Option<&PathBuf>) -> Result<config::ServerConfig> {
    if let Some(path) = path {
        return config::ServerConfig::load(path);
    }
    let auto_path = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")))
        .filter(|path| path.exists());
    match auto_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "using config next to executable");
            config::ServerConfig::load(&path)
        }
        None => Ok(config::ServerConfig::default()),
    }
}

/// Return true when the request path should be logged.
fn should_log_path(path: &str) -> bool {
    !(path == "/health" || path.starts_with("/swagger-ui/") || path.starts_with("/api-doc/"))
}

/// Request details captured before the handler runs.
struct RequestLine {
    method: Method,
    path: String,
    peer: String,
    started: Instant,
}

impl RequestLine {
    fn capture(req: &ServiceRequest) -> Option<Self> {
        should_log_path(req.path()).then(|| Self {
            method: req.method().clone(),
            path: req.path().to_string(),
            peer: req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("-")
                .to_string(),
            started: Instant::now(),
        })
    }

    /// Upgrades are logged with the session they opened; everything else as a plain request.
    fn emit<B>(&self, res: &ServiceResponse<B>) {
        let status = res.status();
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        if status == StatusCode::SWITCHING_PROTOCOLS {
            let session_id = res
                .headers()
                .get(api::SESSION_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");
            tracing::info!(
                path = %self.path,
                peer = %self.peer,
                session_id,
                elapsed_ms,
                "websocket upgraded"
            );
        } else {
            tracing::info!(
                method = %self.method,
                path = %self.path,
                status = status.as_u16(),
                peer = %self.peer,
                elapsed_ms,
                "http request"
            );
        }
    }
}

/// Middleware that logs requests, skipping health checks and API docs.
struct RequestLog;

impl<S, B> Transform<S, ServiceRequest> for RequestLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLogService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RequestLogService { inner: service })
    }
}

struct RequestLogService<S> {
    inner: S,
}

impl<S, B> Service<ServiceRequest> for RequestLogService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(inner);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let line = RequestLine::capture(&req);
        let fut = self.inner.call(req);
        Box::pin(async move {
            let res = fut.await?;
            if let Some(line) = line {
                line.emit(&res);
            }
            Ok(res)
        })
    }
}

//! Actix Web API server for frame analysis and video annotation.
//!
//! The server runs on a dedicated thread so the worker threads and the
//! shutdown sequence stay free of Actix runtime concerns. Handlers hop onto
//! the blocking pool for anything that decodes or infers.

use std::sync::Arc;

use actix_web::{
    http::header::{ContentDisposition, DispositionParam, DispositionType},
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{anyhow, Context, Result};
use tokio::sync::oneshot;
use tracing::error;

use crate::service::{
    data::{FrameAnalyzeRequest, HealthResponse, SubmitResponse, UploadQuery},
    engine::Engine,
    error::ServiceError,
    telemetry,
};

/// Handle for the API server thread.
#[derive(Default)]
pub(crate) struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }

    /// True once the server thread has exited on its own, bind failure
    /// included.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }
}

/// Spawn the API server thread and return a handle that can stop it.
pub(crate) fn spawn_api_server(
    engine: Arc<Engine>,
    bind: String,
    port: u16,
) -> Result<ApiServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("fallwatch-api".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(engine.clone()))
                        // Whole videos arrive as raw request bodies.
                        .app_data(web::PayloadConfig::new(512 * 1024 * 1024))
                        .app_data(web::JsonConfig::default().limit(32 * 1024 * 1024))
                        .route("/health", web::get().to(health_handler))
                        .route("/analyze_frame", web::post().to(analyze_frame_handler))
                        .route("/analyze_video", web::post().to(analyze_video_handler))
                        .route("/annotate_video", web::post().to(annotate_video_handler))
                        .route(
                            "/annotate_video_async",
                            web::post().to(annotate_video_async_handler),
                        )
                        .route(
                            "/annotate_progress/{job_id}",
                            web::get().to(annotate_progress_handler),
                        )
                        .route(
                            "/annotate_result/{job_id}",
                            web::get().to(annotate_result_handler),
                        )
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .disable_signals()
                .bind((bind.as_str(), port))?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("failed to spawn API server thread")?;
    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn health_handler(engine: web::Data<Arc<Engine>>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        device: engine.device_info(),
    })
}

async fn analyze_frame_handler(
    engine: web::Data<Arc<Engine>>,
    body: web::Json<FrameAnalyzeRequest>,
) -> Result<HttpResponse, ServiceError> {
    let engine = engine.into_inner();
    let request = body.into_inner();
    let response = run_blocking(move || engine.analyze_frame(request)).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn analyze_video_handler(
    engine: web::Data<Arc<Engine>>,
    query: web::Query<UploadQuery>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let engine = engine.into_inner();
    let device = query.into_inner().preferred_device;
    let response =
        run_blocking(move || engine.analyze_video(&body, device.as_deref())).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn annotate_video_handler(
    engine: web::Data<Arc<Engine>>,
    query: web::Query<UploadQuery>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let engine = engine.into_inner();
    let query = query.into_inner();
    let device = query.preferred_device;
    let bytes = run_blocking(move || engine.annotate_video_sync(&body, device.as_deref())).await?;
    let filename = format!(
        "annotated_{}",
        query.filename.as_deref().unwrap_or("video.mp4")
    );
    Ok(video_response(bytes, filename))
}

async fn annotate_video_async_handler(
    engine: web::Data<Arc<Engine>>,
    query: web::Query<UploadQuery>,
    body: Bytes,
) -> Result<HttpResponse, ServiceError> {
    let engine = engine.into_inner();
    let query = query.into_inner();
    let job_id = run_blocking(move || {
        engine.submit_annotate(body.to_vec(), query.filename, query.preferred_device.as_deref())
    })
    .await?;
    Ok(HttpResponse::Ok().json(SubmitResponse { job_id }))
}

async fn annotate_progress_handler(
    engine: web::Data<Arc<Engine>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ServiceError> {
    let progress = engine.progress(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(progress))
}

async fn annotate_result_handler(
    engine: web::Data<Arc<Engine>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ServiceError> {
    let engine = engine.into_inner();
    let job_id = path.into_inner();
    let (bytes, source) = run_blocking(move || {
        let (output_path, source) = engine.result(&job_id)?;
        let bytes = std::fs::read(&output_path)
            .map_err(|_| ServiceError::ResultGone)?;
        Ok((bytes, source))
    })
    .await?;
    Ok(video_response(bytes, format!("annotated_{source}")))
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not initialised"),
    }
}

fn video_response(bytes: Vec<u8>, filename: String) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("video/mp4")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(filename)],
        })
        .body(bytes)
}

/// Run blocking engine work on the Actix blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    web::block(f)
        .await
        .map_err(|_| ServiceError::Inference(anyhow!("blocking pool unavailable")))?
}

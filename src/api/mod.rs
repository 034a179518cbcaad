use crate::config::ServiceConfig;
use crate::error::DetectError;
use crate::model::ModelType;
use crate::service::DetectionService;
use crate::stats::GeoPoint;
use crate::video::CancelToken;
use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

mod http;

use http::{read_request, write_error, write_json, HttpRequest, RequestError};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const JOB_POLL: Duration = Duration::from_millis(50);
const DEFAULT_MODEL: ModelType = ModelType::TrafficViolation;
const DEFAULT_VIDEO_EXT: &str = "mp4";
const BANNER: &str = "AI Traffic Violation & Pothole Detection API is running!";

const ROUTES: &[(&str, &str)] = &[
    ("/", "GET"),
    ("/health", "GET"),
    ("/detect_image", "POST"),
    ("/detect_video", "POST"),
    ("/get_detection_stats", "GET"),
    ("/get_recent_detections", "GET"),
    ("/get_detection_locations", "GET"),
];

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_request_bytes: u64,
    pub max_connections: usize,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            max_request_bytes: 256 * 1024 * 1024,
            max_connections: 16,
            upload_dir: PathBuf::from("static/uploads"),
            output_dir: PathBuf::from("static/uploads"),
        }
    }
}

impl From<&ServiceConfig> for ApiConfig {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            addr: cfg.api.addr.clone(),
            max_request_bytes: cfg.api.max_request_bytes,
            max_connections: cfg.api.max_connections,
            upload_dir: cfg.storage.upload_dir.clone(),
            output_dir: cfg.storage.output_dir.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, cancel running video jobs and wait for workers.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<DetectionService>,
}

struct ApiState {
    cfg: ApiConfig,
    service: Arc<DetectionService>,
    shutdown: Arc<AtomicBool>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<DetectionService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        for dir in [&self.cfg.upload_dir, &self.cfg.output_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(ApiState {
            cfg: self.cfg,
            service: self.service,
            shutdown: shutdown.clone(),
        });
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, ctx) {
                log::error!("api: server stopped: {}", err);
            }
        });
        log::info!("api: listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: Arc<ApiState>) -> Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        workers.retain(|w| !w.is_finished());
        match listener.accept() {
            Ok((mut stream, _)) => {
                if active.load(Ordering::SeqCst) >= ctx.cfg.max_connections {
                    log::warn!("api: connection limit reached, rejecting request");
                    let _ = write_error(&mut stream, 503, "busy", "too many concurrent requests");
                    continue;
                }
                let slot = ConnectionSlot::acquire(&active);
                let ctx = Arc::clone(&ctx);
                workers.push(std::thread::spawn(move || {
                    let _slot = slot;
                    if let Err(err) = handle_connection(stream, &ctx) {
                        log::warn!("api: request failed: {:#}", err);
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };
    for worker in workers {
        let _ = worker.join();
    }
    result
}

/// Holds one unit of the active-connection count until dropped, so a
/// panicking handler still frees its slot.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &ApiState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_error(&mut stream, 403, "forbidden", "loopback only")?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(RequestError::HeadersTooLarge) => {
            write_error(&mut stream, 431, "invalid_request", "request headers too large")?;
            return Ok(());
        }
        Err(RequestError::Malformed(msg)) => {
            write_error(&mut stream, 400, "invalid_request", &msg)?;
            return Ok(());
        }
        Err(RequestError::Io(err)) => return Err(err.into()),
    };
    log::debug!("api: {} {} from {}", request.method, request.path, peer);

    let Some(&(_, method)) = ROUTES.iter().find(|(path, _)| *path == request.path) else {
        write_error(&mut stream, 404, "not_found", &request.path)?;
        return Ok(());
    };
    if request.method != method {
        write_error(&mut stream, 405, "method_not_allowed", &request.method)?;
        return Ok(());
    }

    let service = &ctx.service;
    match request.path.as_str() {
        "/" => write_json(&mut stream, 200, &json!({ "message": BANNER })),
        "/health" => write_json(&mut stream, 200, &json!({ "status": "ok" })),
        "/detect_image" => detect_image(&mut stream, &request, ctx),
        "/detect_video" => detect_video(&mut stream, &request, ctx),
        "/get_detection_stats" => write_json(&mut stream, 200, &service.snapshot().counters),
        "/get_recent_detections" => write_json(&mut stream, 200, &service.snapshot().recent),
        "/get_detection_locations" => write_json(&mut stream, 200, &service.locations()),
        _ => write_error(&mut stream, 404, "not_found", &request.path),
    }
}

/// A request that cannot be served, with its HTTP status.
#[derive(Debug)]
struct Rejection {
    status: u16,
    kind: &'static str,
    message: String,
}

impl Rejection {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            kind: "invalid_request",
            message: message.into(),
        }
    }

    fn send(&self, stream: &mut TcpStream) -> Result<()> {
        write_error(stream, self.status, self.kind, &self.message)
    }
}

impl From<DetectError> for Rejection {
    fn from(err: DetectError) -> Self {
        Self {
            status: status_for(&err),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

fn status_for(err: &DetectError) -> u16 {
    match err {
        DetectError::UnknownModel(_) | DetectError::InvalidImage(_) => 400,
        DetectError::SourceNotFound(_) => 404,
        DetectError::UnsupportedCodec(_) => 415,
        DetectError::DetectorFailure(_) => 502,
        DetectError::Cancelled { .. } => 503,
        DetectError::Io(_) => 500,
    }
}

struct JobParams {
    model: ModelType,
    location: Option<GeoPoint>,
    /// Upload extension, used by the video route only.
    ext: String,
    body_len: u64,
}

/// Validate a detection request. Rejected requests are answered here, after
/// draining any body that fits within the limit.
fn accept_job(
    stream: &mut TcpStream,
    request: &HttpRequest,
    max_body: u64,
) -> Result<Option<JobParams>> {
    let body_len = match body_length(request, max_body) {
        Ok(len) => len,
        Err(rejection) => {
            rejection.send(stream)?;
            return Ok(None);
        }
    };
    match job_params(request, body_len) {
        Ok(params) => Ok(Some(params)),
        Err(rejection) => {
            std::io::copy(&mut request.body(stream, body_len)?, &mut std::io::sink())?;
            rejection.send(stream)?;
            Ok(None)
        }
    }
}

fn body_length(request: &HttpRequest, max_body: u64) -> std::result::Result<u64, Rejection> {
    let body_len = request
        .content_length()
        .map_err(|e| Rejection::invalid(e.to_string()))?
        .ok_or(Rejection {
            status: 411,
            kind: "invalid_request",
            message: "Content-Length is required".to_string(),
        })?;
    if body_len == 0 {
        return Err(Rejection::invalid("no file uploaded"));
    }
    if body_len > max_body {
        return Err(Rejection {
            status: 413,
            kind: "invalid_request",
            message: format!("body of {} bytes exceeds limit of {}", body_len, max_body),
        });
    }
    Ok(body_len)
}

fn job_params(request: &HttpRequest, body_len: u64) -> std::result::Result<JobParams, Rejection> {
    let model = match request.param("model_type") {
        Some(name) => name.parse::<ModelType>()?,
        None => DEFAULT_MODEL,
    };
    let location = match (request.param("lat"), request.param("lon")) {
        (None, None) => None,
        (Some(lat), Some(lon)) => {
            let lat: f64 = lat
                .parse()
                .map_err(|_| Rejection::invalid(format!("lat '{}' is not a number", lat)))?;
            let lon: f64 = lon
                .parse()
                .map_err(|_| Rejection::invalid(format!("lon '{}' is not a number", lon)))?;
            Some(GeoPoint::new(lat, lon).map_err(|e| Rejection::invalid(e.to_string()))?)
        }
        _ => return Err(Rejection::invalid("lat and lon must be given together")),
    };
    let ext = video_extension(request.param("ext"))
        .ok_or_else(|| Rejection::invalid("ext must be 1-8 ascii alphanumerics"))?;
    Ok(JobParams {
        model,
        location,
        ext,
        body_len,
    })
}

#[derive(Serialize)]
struct DetectedObject<'a> {
    class: &'a str,
    confidence: f32,
    bbox: [u32; 4],
}

fn detect_image(stream: &mut TcpStream, request: &HttpRequest, ctx: &ApiState) -> Result<()> {
    let Some(params) = accept_job(stream, request, ctx.cfg.max_request_bytes)? else {
        return Ok(());
    };
    let mut bytes = Vec::with_capacity(params.body_len.min(16 * 1024 * 1024) as usize);
    request
        .body(stream, params.body_len)?
        .read_to_end(&mut bytes)
        .context("read image body")?;
    if (bytes.len() as u64) < params.body_len {
        return Rejection::invalid("request body truncated").send(stream);
    }

    let result = match ctx
        .service
        .handle_image_bytes(&bytes, params.model, params.location)
    {
        Ok(result) => result,
        Err(err) => {
            log::warn!("api: detect_image failed: {}", err);
            return Rejection::from(err).send(stream);
        }
    };
    drop(bytes);

    let output = ctx
        .cfg
        .output_dir
        .join(format!("{}_output.jpg", upload_stem()));
    if let Err(err) = result
        .annotated
        .save_with_format(&output, ImageFormat::Jpeg)
    {
        log::error!("api: failed to write {}: {}", output.display(), err);
        return Rejection::from(DetectError::Io(err.to_string())).send(stream);
    }

    let objects: Vec<DetectedObject> = result
        .detections
        .iter()
        .map(|det| DetectedObject {
            class: &det.category,
            confidence: det.confidence,
            bbox: det.bbox.to_array(),
        })
        .collect();
    write_json(
        stream,
        200,
        &json!({
            "message": "Detection complete",
            "model_used": params.model,
            "detected_objects": objects,
            "processed_image": output.display().to_string(),
            "skipped": result.skipped,
        }),
    )
}

fn detect_video(stream: &mut TcpStream, request: &HttpRequest, ctx: &ApiState) -> Result<()> {
    let Some(params) = accept_job(stream, request, ctx.cfg.max_request_bytes)? else {
        return Ok(());
    };

    let stem = upload_stem();
    let input = ctx.cfg.upload_dir.join(format!("{}.{}", stem, params.ext));
    let output = ctx.cfg.output_dir.join(format!("{}_output.mp4", stem));
    let stored = store_upload(
        &mut request.body(stream, params.body_len)?,
        &input,
        params.body_len,
    );
    let copied = match stored {
        Ok(copied) => copied,
        Err(rejection) => return rejection.send(stream),
    };
    log::info!("api: stored upload {} ({} bytes)", input.display(), copied);

    let outcome = run_video_job(stream, ctx, &input, &output, &params);
    match outcome {
        Ok(summary) => write_json(
            stream,
            200,
            &json!({
                "message": "Video processing complete",
                "model_used": params.model,
                "processed_video": summary.output_path,
                "frames_processed": summary.frames_processed,
                "frames_skipped": summary.frames_skipped,
                "detections": summary.detections.len(),
            }),
        ),
        Err(err) => {
            log::warn!("api: detect_video failed: {}", err);
            remove_quietly(&output);
            Rejection::from(err).send(stream)
        }
    }
}

/// Run the job on its own thread, cancelling it when the client goes away
/// or the server shuts down.
fn run_video_job(
    stream: &mut TcpStream,
    ctx: &ApiState,
    input: &Path,
    output: &Path,
    params: &JobParams,
) -> std::result::Result<crate::service::VideoSummary, DetectError> {
    let cancel = CancelToken::new();
    let job = {
        let service = Arc::clone(&ctx.service);
        let cancel = cancel.clone();
        let input = input.display().to_string();
        let output = output.display().to_string();
        let model = params.model;
        let location = params.location;
        std::thread::spawn(move || service.handle_video(&input, &output, model, location, &cancel))
    };

    while !job.is_finished() {
        if !cancel.is_cancelled() {
            if ctx.shutdown.load(Ordering::SeqCst) {
                log::info!("api: shutting down, cancelling video job");
                cancel.cancel();
            } else if client_gone(stream) {
                log::info!("api: client disconnected, cancelling video job");
                cancel.cancel();
            }
        }
        std::thread::sleep(JOB_POLL);
    }
    job.join()
        .map_err(|_| DetectError::Io("video job panicked".to_string()))?
}

/// Stream an upload body into `path`. On any failure the partial file is
/// removed.
fn store_upload(
    body: &mut impl Read,
    path: &Path,
    expected: u64,
) -> std::result::Result<u64, Rejection> {
    let mut file = std::fs::File::create(path).map_err(|err| {
        log::error!("api: failed to create {}: {}", path.display(), err);
        Rejection::from(DetectError::Io(format!("create upload: {}", err)))
    })?;
    let copied = std::io::copy(body, &mut file);
    drop(file);
    match copied {
        Ok(copied) if copied >= expected => Ok(copied),
        Ok(copied) => {
            remove_quietly(path);
            Err(Rejection::invalid(format!(
                "request body truncated ({} of {} bytes)",
                copied, expected
            )))
        }
        Err(err) => {
            log::warn!("api: upload to {} failed: {}", path.display(), err);
            remove_quietly(path);
            Err(upload_failure(err))
        }
    }
}

fn upload_failure(err: std::io::Error) -> Rejection {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => {
            Rejection::invalid(format!("request body could not be read: {}", err))
        }
        _ => Rejection::from(DetectError::Io(format!("write upload: {}", err))),
    }
}

/// Whether the client has gone away while its job runs.
///
/// A peer that half-closes its write side after the body reads as end of
/// stream here and is treated as gone; clients must keep the request side
/// open until the response arrives.
fn client_gone(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut peeked = [0u8; 1];
    let gone = match stream.peek(&mut peeked) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    stream.set_nonblocking(false).is_err() || gone
}

fn upload_stem() -> String {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    format!("upload-{}", hex::encode(id))
}

fn video_extension(requested: Option<&str>) -> Option<String> {
    let ext = requested.unwrap_or(DEFAULT_VIDEO_EXT);
    let valid = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            log::warn!("api: failed to remove {}: {}", path.display(), err);
        }
    }
}

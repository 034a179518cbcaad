use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

use roadwatch::api::{ApiConfig, ApiHandle, ApiServer};
use roadwatch::{
    Annotator, BackendRegistry, DetectionService, DetectorBackend, ModelType, RawDetection,
    StatsAggregator, StubBackend,
};

fn read_response(stream: &mut TcpStream) -> Result<(String, Value)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("");
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body)?
    };
    Ok((headers, json))
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([40, 40, 40]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}

struct TestApi {
    dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(max_request_bytes: u64) -> Result<Self> {
        let mut registry = BackendRegistry::new();
        registry.register(
            ModelType::TrafficViolation,
            StubBackend::with_rows(vec![RawDetection::new(
                "7 - bicycle",
                0.876,
                [2.0, 2.0, 30.0, 30.0],
            )]),
        );
        registry.register(
            ModelType::Pothole,
            StubBackend::with_rows(vec![
                RawDetection::new("pothole", 0.9, [1.0, 1.0, 10.0, 10.0]),
                RawDetection::new("pothole", 0.6, [-4.0, 5.0, 80.0, 12.0]),
            ]),
        );
        Self::start(registry, |cfg| cfg.max_request_bytes = max_request_bytes)
    }

    fn start(registry: BackendRegistry, tune: impl FnOnce(&mut ApiConfig)) -> Result<Self> {
        let dir = tempdir()?;
        let service = Arc::new(DetectionService::new(
            Arc::new(registry),
            Arc::new(Annotator::new()),
            Arc::new(StatsAggregator::default()),
        ));

        let mut api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("outputs"),
            ..ApiConfig::default()
        };
        tune(&mut api_config);
        let api_handle = ApiServer::new(api_config, service).spawn()?;

        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn get(&self, path: &str) -> Result<(String, Value)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn post(&self, path: &str, body: &[u8]) -> Result<(String, Value)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let request = format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            path,
            body.len()
        );
        stream.write_all(request.as_bytes())?;
        stream.write_all(body)?;
        read_response(&mut stream)
    }

    fn upload_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("uploads")
    }

    #[cfg(feature = "video-ffmpeg")]
    fn output_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("outputs")
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn banner_and_health_respond() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.get("/")?;
    assert!(headers.contains("200 OK"));
    assert!(body["message"].as_str().unwrap().contains("is running"));

    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[test]
fn detect_image_reports_objects_and_updates_stats() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.post(
        "/detect_image?model_type=pothole&lat=12.97&lon=77.59",
        &png_bytes(64, 48),
    )?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert_eq!(body["model_used"], "pothole");
    let objects = body["detected_objects"].as_array().unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0]["class"], "pothole");
    assert_eq!(objects[1]["bbox"], serde_json::json!([0, 5, 64, 12]));
    let processed = body["processed_image"].as_str().unwrap();
    assert!(processed.ends_with("_output.jpg"));
    assert!(Path::new(processed).is_file());

    let (_, stats) = api.get("/get_detection_stats")?;
    assert_eq!(stats["Potholes"], 2);
    assert_eq!(stats["Traffic Violation"], 0);

    let (_, recent) = api.get("/get_recent_detections")?;
    let recent = recent.as_array().unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["Type"], "pothole");
    assert_eq!(recent[0]["Confidence"], 0.9);
    assert_eq!(recent[0]["Model"], "pothole");
    assert_eq!(recent[0]["latitude"], 12.97);

    let (_, locations) = api.get("/get_detection_locations")?;
    let locations = locations.as_array().unwrap();
    assert_eq!(locations.len(), 2);
    assert_eq!(locations[1]["event"], "pothole");
    assert_eq!(locations[1]["longitude"], 77.59);
    Ok(())
}

#[test]
fn default_model_maps_traffic_labels() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.post("/detect_image", &png_bytes(32, 32))?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert_eq!(body["model_used"], "traffic_violation");
    assert_eq!(body["detected_objects"][0]["class"], "Bicycle Violation");

    let (_, recent) = api.get("/get_recent_detections")?;
    assert!(recent[0].get("latitude").is_none());
    Ok(())
}

#[test]
fn caller_errors_leave_stats_unchanged() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.post("/detect_image?model_type=bridges", &png_bytes(8, 8))?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "unknown_model");

    let (headers, body) = api.post("/detect_image?model_type=pothole", b"not an image")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "invalid_image");

    let (headers, body) = api.post("/detect_image?model_type=pothole&lat=10", &png_bytes(8, 8))?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "invalid_request");

    let (headers, body) = api.post(
        "/detect_image?model_type=pothole&lat=95&lon=10",
        &png_bytes(8, 8),
    )?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "invalid_request");

    let (_, stats) = api.get("/get_detection_stats")?;
    assert_eq!(stats["Potholes"], 0);
    assert_eq!(stats["Traffic Violation"], 0);
    let (_, recent) = api.get("/get_recent_detections")?;
    assert_eq!(recent.as_array().unwrap().len(), 0);
    Ok(())
}

#[test]
fn unknown_routes_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.get("/events")?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["error"], "not_found");

    let (headers, _) = api.get("/detect_image")?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn oversized_body_is_rejected_before_reading() -> Result<()> {
    let api = TestApi::new(64)?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(
        b"POST /detect_image HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4096\r\n\r\n",
    )?;
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.contains("413 Payload Too Large"));
    Ok(())
}

#[cfg(not(feature = "video-ffmpeg"))]
#[test]
fn video_upload_is_stored_then_rejected_without_decoder() -> Result<()> {
    let api = TestApi::new(1024 * 1024)?;

    let (headers, body) = api.post("/detect_video?model_type=pothole", b"fake video bytes")?;
    assert!(headers.contains("415 Unsupported Media Type"), "{}", headers);
    assert_eq!(body["error"], "unsupported_codec");

    let uploads: Vec<_> = std::fs::read_dir(api.upload_dir())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].starts_with("upload-") && uploads[0].ends_with(".mp4"));
    assert_eq!(uploads[0].len(), "upload-".len() + 16 + ".mp4".len());
    Ok(())
}

/// Panics on every call.
struct ExplodingBackend;

impl DetectorBackend for ExplodingBackend {
    fn name(&self) -> &'static str {
        "exploding"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
        panic!("model runtime crashed");
    }
}

#[test]
fn panicking_backend_answers_502_and_keeps_server_available() -> Result<()> {
    let mut registry = BackendRegistry::new();
    registry.register(ModelType::TrafficViolation, ExplodingBackend);
    registry.register(ModelType::Pothole, ExplodingBackend);
    let api = TestApi::start(registry, |cfg| cfg.max_connections = 2)?;

    for _ in 0..4 {
        let (headers, body) = api.post("/detect_image?model_type=pothole", &png_bytes(16, 16))?;
        assert!(headers.contains("502 Bad Gateway"), "{}", headers);
        assert_eq!(body["error"], "detector_failure");
    }

    let (headers, body) = api.get("/health")?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[cfg(feature = "video-ffmpeg")]
mod video {
    use super::*;
    use roadwatch::video::open_writer;
    use roadwatch::{FrameRate, VideoInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn encode_clip(path: &Path, frames: u32) -> Result<Vec<u8>> {
        let info = VideoInfo {
            width: 64,
            height: 48,
            frame_rate: FrameRate::per_second(25),
        };
        let mut writer = open_writer(path.to_str().unwrap(), info)?;
        for index in 0..frames {
            let frame = RgbImage::from_fn(64, 48, |x, y| {
                let v = ((x + y + index * 5) % 256) as u8;
                Rgb([v, 90, 255 - v])
            });
            writer.write_frame(&frame)?;
        }
        writer.finish()?;
        Ok(std::fs::read(path)?)
    }

    fn outputs(api: &TestApi) -> Result<Vec<String>> {
        Ok(std::fs::read_dir(api.output_dir())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect())
    }

    #[test]
    fn detect_video_reports_frames_and_detections() -> Result<()> {
        let api = TestApi::new(16 * 1024 * 1024)?;
        let clip = encode_clip(&api.dir.path().join("clip.mp4"), 10)?;

        let (headers, body) = api.post("/detect_video?model_type=pothole", &clip)?;
        assert!(headers.contains("200 OK"), "{}", headers);
        assert_eq!(body["message"], "Video processing complete");
        assert_eq!(body["model_used"], "pothole");
        assert_eq!(body["frames_processed"], 10);
        assert_eq!(body["frames_skipped"], 0);
        assert_eq!(body["detections"], 20);
        let processed = body["processed_video"].as_str().unwrap();
        assert!(processed.ends_with("_output.mp4"), "{}", processed);
        assert!(Path::new(processed).is_file());

        let (_, stats) = api.get("/get_detection_stats")?;
        assert_eq!(stats["Potholes"], 20);
        Ok(())
    }

    /// Sleeps per frame and counts its calls.
    struct SlowBackend {
        calls: Arc<AtomicUsize>,
    }

    impl DetectorBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(vec![RawDetection::new("pothole", 0.8, [1.0, 1.0, 9.0, 9.0])])
        }
    }

    #[test]
    fn client_disconnect_cancels_running_job() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = BackendRegistry::new();
        registry.register(
            ModelType::Pothole,
            SlowBackend {
                calls: Arc::clone(&calls),
            },
        );
        let api = TestApi::start(registry, |cfg| cfg.max_request_bytes = 16 * 1024 * 1024)?;
        let total_frames = 150;
        let clip = encode_clip(&api.dir.path().join("clip.mp4"), total_frames)?;

        let mut stream = TcpStream::connect(api.handle().addr)?;
        let request = format!(
            "POST /detect_video?model_type=pothole HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            clip.len()
        );
        stream.write_all(request.as_bytes())?;
        stream.write_all(&clip)?;
        let started = Instant::now();
        while calls.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(stream);

        // Wait for the frame count to settle once the job notices.
        let mut last = calls.load(Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            std::thread::sleep(Duration::from_millis(250));
            let now = calls.load(Ordering::SeqCst);
            if now == last || Instant::now() > deadline {
                break;
            }
            last = now;
        }

        assert!(last < total_frames as usize, "job ran all {} frames", last);
        let (_, stats) = api.get("/get_detection_stats")?;
        assert_eq!(stats["Potholes"], 0);
        assert!(
            outputs(&api)?.iter().all(|name| !name.ends_with("_output.mp4")),
            "cancelled output should be removed"
        );
        Ok(())
    }
}

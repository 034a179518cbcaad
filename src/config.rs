use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::annotate::Annotator;
use crate::detect::BackendRegistry;
use crate::model::ModelType;
use crate::stats::{StatsAggregator, DEFAULT_RECENT_CAPACITY};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MAX_REQUEST_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_MAX_CONNECTIONS: usize = 16;
const DEFAULT_STORAGE_DIR: &str = "static/uploads";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONF_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServiceConfigFile {
    api: Option<ApiConfigFile>,
    storage: Option<StorageConfigFile>,
    stats: Option<StatsConfigFile>,
    annotate: Option<AnnotateConfigFile>,
    models: Option<ModelsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_request_bytes: Option<u64>,
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    upload_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsConfigFile {
    recent_events_capacity: Option<usize>,
    max_locations: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotateConfigFile {
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    traffic_violation: Option<ModelConfigFile>,
    pothole: Option<ModelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    onnx_path: Option<PathBuf>,
    labels: Option<Vec<String>>,
    input_size: Option<u32>,
    conf_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api: ApiSettings,
    pub storage: StorageSettings,
    pub stats: StatsSettings,
    pub font_path: Option<PathBuf>,
    pub traffic_violation: ModelSettings,
    pub pothole: ModelSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub max_request_bytes: u64,
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StatsSettings {
    pub recent_events_capacity: usize,
    pub max_locations: Option<usize>,
}

/// Detector settings for one domain model.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Without a model file the model is served by an empty stub backend.
    pub onnx_path: Option<PathBuf>,
    pub labels: Vec<String>,
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl ServiceConfig {
    /// Load from `ROADWATCH_CONFIG` (JSON, or TOML by extension), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let stats = file.stats.unwrap_or_default();
        let models = file.models.unwrap_or_default();
        Self {
            api: ApiSettings {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                max_request_bytes: api.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
                max_connections: api.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
            storage: StorageSettings {
                upload_dir: storage
                    .upload_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
                output_dir: storage
                    .output_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
            },
            stats: StatsSettings {
                recent_events_capacity: stats
                    .recent_events_capacity
                    .unwrap_or(DEFAULT_RECENT_CAPACITY),
                max_locations: stats.max_locations,
            },
            font_path: file.annotate.and_then(|annotate| annotate.font_path),
            traffic_violation: ModelSettings::from_file(models.traffic_violation),
            pothole: ModelSettings::from_file(models.pothole),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("ROADWATCH_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(max) = std::env::var("ROADWATCH_MAX_REQUEST_BYTES") {
            self.api.max_request_bytes = max.trim().parse().map_err(|_| {
                anyhow!("ROADWATCH_MAX_REQUEST_BYTES must be an integer number of bytes")
            })?;
        }
        if let Ok(dir) = std::env::var("ROADWATCH_UPLOAD_DIR") {
            if !dir.trim().is_empty() {
                self.storage.upload_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("ROADWATCH_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.storage.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("ROADWATCH_FONT_PATH") {
            if !path.trim().is_empty() {
                self.font_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.api
            .addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api.addr '{}' is not a socket address", self.api.addr))?;
        if self.api.max_request_bytes == 0 {
            return Err(anyhow!("api.max_request_bytes must be greater than zero"));
        }
        if self.api.max_connections == 0 {
            return Err(anyhow!("api.max_connections must be greater than zero"));
        }
        if self.stats.recent_events_capacity == 0 {
            return Err(anyhow!("stats.recent_events_capacity must be at least 1"));
        }
        for model in ModelType::ALL {
            self.model(model)
                .validate()
                .map_err(|e| anyhow!("models.{}: {}", model, e))?;
        }
        Ok(())
    }

    pub fn model(&self, model: ModelType) -> &ModelSettings {
        match model {
            ModelType::TrafficViolation => &self.traffic_violation,
            ModelType::Pothole => &self.pothole,
        }
    }

    pub fn build_stats(&self) -> StatsAggregator {
        StatsAggregator::new(self.stats.recent_events_capacity, self.stats.max_locations)
    }

    pub fn build_annotator(&self) -> Result<Annotator> {
        match &self.font_path {
            Some(path) => Annotator::new().with_font_file(path),
            None => {
                log::warn!("config: no font_path configured, labels are drawn without text");
                Ok(Annotator::new())
            }
        }
    }

    /// Register a backend for every model with a model file. Models left
    /// out fail their requests with `unknown_model`.
    pub fn build_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        for model in ModelType::ALL {
            let settings = self.model(model);
            match &settings.onnx_path {
                Some(path) => register_onnx(&mut registry, model, path, settings)?,
                None => log::warn!("config: no onnx_path for {}, model disabled", model),
            }
        }
        Ok(registry)
    }
}

impl ModelSettings {
    fn from_file(file: Option<ModelConfigFile>) -> Self {
        let file = file.unwrap_or_default();
        Self {
            onnx_path: file.onnx_path,
            labels: file.labels.unwrap_or_default(),
            input_size: file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            conf_threshold: file.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
            iou_threshold: file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(anyhow!(
                "input_size must be a positive multiple of 32, got {}",
                self.input_size
            ));
        }
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(anyhow!("conf_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow!("iou_threshold must be within [0, 1]"));
        }
        Ok(())
    }
}

#[cfg(feature = "backend-tract")]
fn register_onnx(
    registry: &mut BackendRegistry,
    model: ModelType,
    path: &Path,
    settings: &ModelSettings,
) -> Result<()> {
    use crate::detect::{TractBackend, TractSettings};

    let backend = TractBackend::new(
        path,
        TractSettings {
            input_size: settings.input_size,
            conf_threshold: settings.conf_threshold,
            iou_threshold: settings.iou_threshold,
            labels: settings.labels.clone(),
            ..TractSettings::default()
        },
    )
    .with_context(|| format!("load {} model", model))?;
    log::info!("config: loaded {} model from {}", model, path.display());
    registry.register(model, backend);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_onnx(
    _registry: &mut BackendRegistry,
    model: ModelType,
    path: &Path,
    _settings: &ModelSettings,
) -> Result<()> {
    Err(anyhow!(
        "{} model {} configured but the backend-tract feature is disabled",
        model,
        path.display()
    ))
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

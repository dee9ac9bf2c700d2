use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::filter::FilterParams;
use crate::infer::ColorMode;
use crate::ingest::framing::{DEFAULT_BACKLOG_THRESHOLD, DEFAULT_CHUNK_SIZE};
use crate::telemetry::{default_routes, Route};

const DEFAULT_OSC_ADDR: &str = "127.0.0.1:8889";
const DEFAULT_BAUD_RATE: u32 = 3_000_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SOURCE_WIDTH: u32 = 240;
const DEFAULT_SOURCE_HEIGHT: u32 = 240;
const DEFAULT_SOURCE_FPS: u32 = 60;
const DEFAULT_GAZE_INPUT: u32 = 240;
const DEFAULT_BLINK_INPUT: u32 = 256;
const DEFAULT_TICK_HZ: f64 = 60.0;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
struct GazeConfigFile {
    sources: Option<Vec<SourceFile>>,
    serial: Option<SerialFile>,
    models: Option<Vec<ModelFile>>,
    telemetry: Option<TelemetryFile>,
    pipeline: Option<PipelineFile>,
}

#[derive(Debug, Deserialize)]
struct SourceFile {
    id: String,
    device: String,
    kind: Option<SourceKind>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SerialFile {
    baud_rate: Option<u32>,
    read_timeout_ms: Option<u64>,
    backlog_threshold: Option<usize>,
    chunk_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    id: String,
    path: String,
    source: String,
    outputs: usize,
    input: Option<InputFile>,
    filter: Option<FilterFile>,
}

#[derive(Debug, Deserialize, Default)]
struct InputFile {
    width: Option<u32>,
    height: Option<u32>,
    color: Option<ColorMode>,
}

#[derive(Debug, Deserialize, Default)]
struct FilterFile {
    min_cutoff: Option<f64>,
    beta: Option<f64>,
    d_cutoff: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryFile {
    addr: Option<String>,
    routes: Option<Vec<Route>>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineFile {
    tick_hz: Option<f64>,
    parallel_inference: Option<bool>,
    stats_interval_secs: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
}

/// Capture backend family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// USB video-class camera.
    Uvc,
    /// Serial-attached camera speaking the framed JPEG protocol.
    Serial,
}

impl SourceKind {
    /// Guess the backend from a device string.
    pub fn infer(device: &str) -> Option<Self> {
        let device = device.trim();
        if device.starts_with("stub://")
            || device.starts_with("/dev/video")
            || (!device.is_empty() && device.chars().all(|c| c.is_ascii_digit()))
        {
            return Some(SourceKind::Uvc);
        }
        if device.to_ascii_uppercase().starts_with("COM")
            || device.starts_with("/dev/tty")
            || device.starts_with("/dev/cu.")
        {
            return Some(SourceKind::Serial);
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct GazeConfig {
    pub sources: Vec<SourceSettings>,
    pub serial: SerialSettings,
    pub models: Vec<ModelSettings>,
    pub telemetry: TelemetrySettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub id: String,
    pub device: String,
    /// Explicit backend; inferred from `device` when unset.
    pub kind: Option<SourceKind>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SourceSettings {
    pub fn kind(&self) -> Option<SourceKind> {
        self.kind.or_else(|| SourceKind::infer(&self.device))
    }

    fn stub(id: &str) -> Self {
        Self {
            id: id.to_string(),
            device: format!("stub://{}", id),
            kind: None,
            width: DEFAULT_SOURCE_WIDTH,
            height: DEFAULT_SOURCE_HEIGHT,
            fps: DEFAULT_SOURCE_FPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub backlog_threshold: usize,
    pub chunk_size: usize,
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            backlog_threshold: DEFAULT_BACKLOG_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub id: String,
    /// ONNX file or directory, or `stub://<name>` for the built-in centroid model.
    pub path: String,
    /// Id of the source whose frames feed this model.
    pub source: String,
    pub input: InputSettings,
    /// Output arity; channels are assigned consecutively in model order.
    pub outputs: usize,
    pub filter: FilterSettings,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSettings {
    pub width: u32,
    pub height: u32,
    pub color: ColorMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSettings {
    pub min_cutoff: f64,
    pub beta: f64,
    pub d_cutoff: f64,
}

impl FilterSettings {
    pub fn params(&self) -> FilterParams {
        FilterParams {
            min_cutoff: self.min_cutoff,
            beta: self.beta,
            d_cutoff: self.d_cutoff,
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterParams::gaze().into()
    }
}

impl From<FilterParams> for FilterSettings {
    fn from(params: FilterParams) -> Self {
        Self {
            min_cutoff: params.min_cutoff,
            beta: params.beta,
            d_cutoff: params.d_cutoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    /// `host:port` of the OSC receiver.
    pub addr: String,
    pub routes: Vec<Route>,
}

impl TelemetrySettings {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .to_socket_addrs()
            .with_context(|| format!("invalid telemetry address {}", self.addr))?
            .next()
            .ok_or_else(|| anyhow!("telemetry address {} resolved to nothing", self.addr))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub tick_hz: f64,
    pub parallel_inference: bool,
    pub stats_interval_secs: u64,
    pub shutdown_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl PipelineSettings {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick_hz: DEFAULT_TICK_HZ,
            parallel_inference: true,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

fn default_sources() -> Vec<SourceSettings> {
    vec![SourceSettings::stub("left"), SourceSettings::stub("right")]
}

fn default_models() -> Vec<ModelSettings> {
    let model = |id: &str, source: &str, side: u32, outputs: usize, params: FilterParams| {
        ModelSettings {
            id: id.to_string(),
            path: format!("stub://{}", id),
            source: source.to_string(),
            input: InputSettings {
                width: side,
                height: side,
                color: ColorMode::Gray,
            },
            outputs,
            filter: params.into(),
        }
    };
    vec![
        model("left_gaze", "left", DEFAULT_GAZE_INPUT, 2, FilterParams::gaze()),
        model("right_gaze", "right", DEFAULT_GAZE_INPUT, 2, FilterParams::gaze()),
        model("blink", "left", DEFAULT_BLINK_INPUT, 1, FilterParams::eyelid()),
    ]
}

impl Default for GazeConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            serial: SerialSettings::default(),
            models: default_models(),
            telemetry: TelemetrySettings {
                addr: DEFAULT_OSC_ADDR.to_string(),
                routes: default_routes(),
            },
            pipeline: PipelineSettings::default(),
        }
    }
}

impl GazeConfig {
    /// Load from the file named by `GAZE_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GAZE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (or defaults only), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GazeConfigFile) -> Self {
        let defaults = Self::default();

        let sources = match file.sources {
            Some(sources) => sources
                .into_iter()
                .map(|source| SourceSettings {
                    id: source.id,
                    device: source.device,
                    kind: source.kind,
                    width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                    height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                    fps: source.fps.unwrap_or(DEFAULT_SOURCE_FPS),
                })
                .collect(),
            None => defaults.sources,
        };

        let serial_file = file.serial.unwrap_or_default();
        let serial = SerialSettings {
            baud_rate: serial_file.baud_rate.unwrap_or(defaults.serial.baud_rate),
            read_timeout_ms: serial_file
                .read_timeout_ms
                .unwrap_or(defaults.serial.read_timeout_ms),
            backlog_threshold: serial_file
                .backlog_threshold
                .unwrap_or(defaults.serial.backlog_threshold),
            chunk_size: serial_file.chunk_size.unwrap_or(defaults.serial.chunk_size),
        };

        let models = match file.models {
            Some(models) => models.into_iter().map(model_from_file).collect(),
            None => defaults.models,
        };

        let telemetry_file = file.telemetry.unwrap_or_default();
        let telemetry = TelemetrySettings {
            addr: telemetry_file.addr.unwrap_or(defaults.telemetry.addr),
            routes: telemetry_file.routes.unwrap_or(defaults.telemetry.routes),
        };

        let pipeline_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            tick_hz: pipeline_file.tick_hz.unwrap_or(defaults.pipeline.tick_hz),
            parallel_inference: pipeline_file
                .parallel_inference
                .unwrap_or(defaults.pipeline.parallel_inference),
            stats_interval_secs: pipeline_file
                .stats_interval_secs
                .unwrap_or(defaults.pipeline.stats_interval_secs),
            shutdown_timeout_ms: pipeline_file
                .shutdown_timeout_ms
                .unwrap_or(defaults.pipeline.shutdown_timeout_ms),
            reconnect_delay_ms: pipeline_file
                .reconnect_delay_ms
                .unwrap_or(defaults.pipeline.reconnect_delay_ms),
        };

        Self {
            sources,
            serial,
            models,
            telemetry,
            pipeline,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("GAZE_OSC_ADDR") {
            if !addr.trim().is_empty() {
                self.telemetry.addr = addr.trim().to_string();
            }
        }
        if let Ok(hz) = std::env::var("GAZE_TICK_HZ") {
            self.pipeline.tick_hz = hz
                .trim()
                .parse()
                .map_err(|_| anyhow!("GAZE_TICK_HZ must be a number of ticks per second"))?;
        }
        if let Ok(threshold) = std::env::var("GAZE_BACKLOG_THRESHOLD") {
            self.serial.backlog_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("GAZE_BACKLOG_THRESHOLD must be a byte count"))?;
        }
        for source in &mut self.sources {
            if let Ok(device) = std::env::var(source_env_key(&source.id)) {
                if !device.trim().is_empty() {
                    source.device = device.trim().to_string();
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        if self.models.is_empty() {
            return Err(anyhow!("at least one model must be configured"));
        }

        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(anyhow!("source id must not be empty"));
            }
            if !source_ids.insert(source.id.as_str()) {
                return Err(anyhow!("duplicate source id '{}'", source.id));
            }
            if source.kind().is_none() {
                return Err(anyhow!(
                    "cannot tell whether '{}' (source '{}') is a camera or serial port; set kind",
                    source.device,
                    source.id
                ));
            }
            if source.width == 0 || source.height == 0 {
                return Err(anyhow!("source '{}' has zero frame size", source.id));
            }
        }

        let mut model_ids = HashSet::new();
        for model in &self.models {
            if !model_ids.insert(model.id.as_str()) {
                return Err(anyhow!("duplicate model id '{}'", model.id));
            }
            if !source_ids.contains(model.source.as_str()) {
                return Err(anyhow!(
                    "model '{}' reads unknown source '{}'",
                    model.id,
                    model.source
                ));
            }
            if model.outputs == 0 {
                return Err(anyhow!("model '{}' must have at least one output", model.id));
            }
            if model.input.width == 0 || model.input.height == 0 {
                return Err(anyhow!("model '{}' has zero input size", model.id));
            }
            model
                .filter
                .params()
                .validate()
                .with_context(|| format!("model '{}' filter", model.id))?;
        }

        let channels = self.total_channels();
        for route in &self.telemetry.routes {
            if route.channel >= channels {
                return Err(anyhow!(
                    "route {} reads channel {} but models produce {} channels",
                    route.path,
                    route.channel,
                    channels
                ));
            }
            if !route.path.starts_with('/') {
                return Err(anyhow!("route path {} must start with '/'", route.path));
            }
        }
        self.telemetry.socket_addr()?;

        if !(self.pipeline.tick_hz.is_finite() && self.pipeline.tick_hz > 0.0) {
            return Err(anyhow!("tick_hz must be greater than zero"));
        }
        if self.pipeline.stats_interval_secs == 0 {
            return Err(anyhow!("stats_interval_secs must be greater than zero"));
        }
        if self.serial.backlog_threshold == 0 {
            return Err(anyhow!("backlog_threshold must be greater than zero"));
        }
        if self.serial.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be greater than zero"));
        }
        Ok(())
    }

    /// Width of the concatenated model output vector.
    pub fn total_channels(&self) -> usize {
        self.models.iter().map(|model| model.outputs).sum()
    }

    /// `(channel_count, params)` per model, in channel order.
    pub fn filter_groups(&self) -> Vec<(usize, FilterParams)> {
        self.models
            .iter()
            .map(|model| (model.outputs, model.filter.params()))
            .collect()
    }
}

fn model_from_file(model: ModelFile) -> ModelSettings {
    let input = model.input.unwrap_or_default();
    let filter = model.filter.unwrap_or_default();
    let defaults = FilterSettings::default();
    ModelSettings {
        id: model.id,
        path: model.path,
        source: model.source,
        input: InputSettings {
            width: input.width.unwrap_or(DEFAULT_GAZE_INPUT),
            height: input.height.unwrap_or(DEFAULT_GAZE_INPUT),
            color: input.color.unwrap_or(ColorMode::Gray),
        },
        outputs: model.outputs,
        filter: FilterSettings {
            min_cutoff: filter.min_cutoff.unwrap_or(defaults.min_cutoff),
            beta: filter.beta.unwrap_or(defaults.beta),
            d_cutoff: filter.d_cutoff.unwrap_or(defaults.d_cutoff),
        },
    }
}

/// Env var overriding the device of source `id` (`left` -> `GAZE_SOURCE_LEFT`).
pub fn source_env_key(id: &str) -> String {
    let suffix: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("GAZE_SOURCE_{}", suffix)
}

fn read_config_file(path: &Path) -> Result<GazeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_inference() {
        assert_eq!(SourceKind::infer("0"), Some(SourceKind::Uvc));
        assert_eq!(SourceKind::infer("/dev/video2"), Some(SourceKind::Uvc));
        assert_eq!(SourceKind::infer("stub://left"), Some(SourceKind::Uvc));
        assert_eq!(SourceKind::infer("COM4"), Some(SourceKind::Serial));
        assert_eq!(SourceKind::infer("/dev/ttyACM0"), Some(SourceKind::Serial));
        assert_eq!(SourceKind::infer("camera"), None);
        assert_eq!(SourceKind::infer(""), None);
    }

    #[test]
    fn defaults_are_valid_and_canonical() {
        let cfg = GazeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.total_channels(), 5);
        let ids: Vec<&str> = cfg.models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["left_gaze", "right_gaze", "blink"]);
        assert_eq!(cfg.models[2].input.width, 256);
        assert_eq!(cfg.filter_groups()[2], (1, FilterParams::eyelid()));
    }

    #[test]
    fn env_key_is_uppercased_and_sanitized() {
        assert_eq!(source_env_key("left"), "GAZE_SOURCE_LEFT");
        assert_eq!(source_env_key("eye-2"), "GAZE_SOURCE_EYE_2");
    }

    #[test]
    fn validation_rejects_broken_wiring() {
        let mut cfg = GazeConfig::default();
        cfg.models[0].source = "center".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = GazeConfig::default();
        cfg.telemetry.routes.push(Route::new("/p", 5, false));
        assert!(cfg.validate().is_err());

        let mut cfg = GazeConfig::default();
        cfg.sources[1].id = "left".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = GazeConfig::default();
        cfg.models[1].filter.min_cutoff = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = GazeConfig::default();
        cfg.sources[0].device = "camera".to_string();
        assert!(cfg.validate().is_err());
        cfg.sources[0].kind = Some(SourceKind::Serial);
        assert!(cfg.validate().is_ok());

        let mut cfg = GazeConfig::default();
        cfg.telemetry.addr = "not an address".to_string();
        assert!(cfg.validate().is_err());
    }
}

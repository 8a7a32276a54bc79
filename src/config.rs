//! Configuration: command-line settings, per-job recognition options and the
//! catalog of models a deployment offers.

use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// Which recognition clients to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendType {
    /// Call the detector and recognizer services over HTTP.
    #[default]
    Http,
    /// Deterministic offline stand-ins, for smoke tests.
    Echo,
}

/// Settings shared by every subcommand. Each one can also be set from the
/// environment (or a `.env` file).
#[derive(Clone, Debug, Args)]
pub struct Settings {
    /// Redis URL for the shared job store and task queue. Without one, state
    /// lives in this process only.
    #[clap(long, env = "OCR_REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key we touch.
    #[clap(long, env = "OCR_KEY_PREFIX", default_value = "ocr-pipeline:", global = true)]
    pub key_prefix: String,

    /// Directory holding job records, page results and archived pages.
    #[clap(long, env = "OCR_DATA_DIR", default_value = "./ocr-data", global = true)]
    pub data_dir: PathBuf,

    /// Base URL of the region detector service.
    #[clap(long, env = "OCR_DETECTOR_URL", global = true)]
    pub detector_url: Option<String>,

    /// Base URL of the text recognizer service.
    #[clap(long, env = "OCR_RECOGNIZER_URL", global = true)]
    pub recognizer_url: Option<String>,

    /// Recognition backend.
    #[clap(long, env = "OCR_BACKEND", value_enum, default_value_t = BackendType::Http, global = true)]
    pub backend: BackendType,

    /// Seconds to wait for a single recognition call.
    #[clap(long, env = "OCR_CALL_TIMEOUT", default_value = "120", global = true)]
    pub call_timeout: u64,

    /// Refuse new jobs while more than this many are in flight.
    #[clap(long, env = "OCR_MAX_IN_FLIGHT", default_value = "100", global = true)]
    pub max_in_flight: usize,

    /// Max number of tasks to process at a time.
    #[clap(short = 'j', long = "jobs", env = "OCR_WORKERS", global = true)]
    pub worker_count: Option<usize>,

    /// How long to sleep when every queue lane is empty.
    #[clap(long, env = "OCR_POLL_INTERVAL_MS", default_value = "250", global = true)]
    pub poll_interval_ms: u64,

    /// JSON or TOML file listing the available detectors and recognizers.
    #[clap(long, env = "OCR_CATALOG", global = true)]
    pub catalog: Option<PathBuf>,
}

impl Settings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Load the model catalog, if one was configured.
    pub async fn load_catalog(&self) -> Result<Option<ModelCatalog>> {
        match &self.catalog {
            Some(path) => Ok(Some(ModelCatalog::from_path(path).await?)),
            None => Ok(None),
        }
    }
}

/// How to recognize the pages of one job.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RecognitionConfig {
    /// Region detector model ID.
    pub detector: String,

    /// Text recognizer model ID.
    pub recognizer: String,

    /// Language hint passed to the detector.
    #[serde(default = "default_language")]
    pub language: String,

    /// May the detector pad the page before looking for regions?
    #[serde(default = "default_allow_padding")]
    pub allow_padding: bool,

    /// Merge detector fragments into lines before recognition.
    #[serde(default)]
    pub merge_regions: bool,
}

fn default_language() -> String {
    "en".to_owned()
}

fn default_allow_padding() -> bool {
    true
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            detector: "default".to_owned(),
            recognizer: "default".to_owned(),
            language: default_language(),
            allow_padding: default_allow_padding(),
            merge_regions: false,
        }
    }
}

/// The detectors and recognizers this deployment offers.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub recognizers: Vec<String>,
}

impl ModelCatalog {
    /// Read a catalog from a JSON or TOML file.
    pub async fn from_path(path: &Path) -> Result<Self> {
        read_json_or_toml(path)
            .await
            .with_context(|| format!("failed to load model catalog {:?}", path))
    }

    /// Return the names of the config fields that don't name a known model.
    pub fn validate(&self, config: &RecognitionConfig) -> Vec<&'static str> {
        let mut invalid = vec![];
        if !self.detectors.contains(&config.detector) {
            invalid.push("detector");
        }
        if !self.recognizers.contains(&config.recognizer) {
            invalid.push("recognizer");
        }
        invalid
    }
}

/// Validate `config` against an optional catalog. Without a catalog, any
/// non-empty model ID is accepted.
pub fn invalid_config_keys(
    catalog: Option<&ModelCatalog>,
    config: &RecognitionConfig,
) -> Vec<&'static str> {
    match catalog {
        Some(catalog) => catalog.validate(config),
        None => {
            let mut invalid = vec![];
            if config.detector.trim().is_empty() {
                invalid.push("detector");
            }
            if config.recognizer.trim().is_empty() {
                invalid.push("recognizer");
            }
            invalid
        }
    }
}

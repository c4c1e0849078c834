use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Characters the shipped CRNN model was trained on. Class 0 is blank.
pub const DEFAULT_ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model_config: ModelConfig,
    pub queue_config: QueueConfig,
    pub alphabet: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub download_url: Option<String>, // fetched only when `path` is missing
    pub input_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub timeout: Duration,
    pub skip_abandoned: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            timeout: Duration::from_secs(10),
            skip_abandoned: false,
        }
    }
}

/// Geometry of the preprocessing transform. These values are baked into the
/// trained weights, so they are not read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub crop_width: u32,
    pub crop_height: u32,
    pub target_width: u32,
    pub target_height: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            crop_width: 120,
            crop_height: 25,
            target_width: 120,
            target_height: 32,
        }
    }
}

/// Ordered character set for CTC decoding. Index 0 is reserved for blank, so
/// class `i` maps to `chars[i - 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    chars: Vec<char>,
}

impl Vocabulary {
    pub const BLANK: usize = 0;

    pub fn new(alphabet: &str) -> Result<Self> {
        let chars: Vec<char> = alphabet.chars().collect();
        if chars.is_empty() {
            return Err(anyhow!("Alphabet must not be empty"));
        }

        let mut seen = HashSet::new();
        for c in &chars {
            if !seen.insert(*c) {
                return Err(anyhow!("Alphabet contains duplicate character {:?}", c));
            }
        }

        Ok(Self { chars })
    }

    /// Number of model output classes, including blank.
    pub fn num_classes(&self) -> usize {
        self.chars.len() + 1
    }

    /// Character for a class index, `None` for blank or out of range.
    pub fn char_for(&self, class: usize) -> Option<char> {
        if class == Self::BLANK {
            return None;
        }
        self.chars.get(class - 1).copied()
    }

    /// Class index for a character, if it is in the alphabet.
    pub fn class_of(&self, c: char) -> Option<usize> {
        self.chars.iter().position(|&x| x == c).map(|i| i + 1)
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            chars: DEFAULT_ALPHABET.chars().collect(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let api_port = env::var("API_PORT")
            .unwrap_or_else(|_| "6000".to_string())
            .parse()
            .map_err(|e| anyhow!("Invalid API_PORT: {}", e))?;

        let model_path = env::var("CAPTCHA_MODEL_PATH")
            .unwrap_or_else(|_| "captcha_crnn.onnx".to_string());

        let download_url = env::var("CAPTCHA_MODEL_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let input_name = env::var("CAPTCHA_MODEL_INPUT").unwrap_or_else(|_| "input".to_string());

        let defaults = QueueConfig::default();

        let capacity: usize = match env::var("CAPTCHA_QUEUE_CAPACITY") {
            Ok(v) => v
                .parse()
                .map_err(|e| anyhow!("Invalid CAPTCHA_QUEUE_CAPACITY: {}", e))?,
            Err(_) => defaults.capacity,
        };
        if capacity == 0 {
            return Err(anyhow!("CAPTCHA_QUEUE_CAPACITY must be at least 1"));
        }

        let timeout = match env::var("CAPTCHA_TIMEOUT_SECS") {
            Ok(v) => {
                let secs: f64 = v
                    .parse()
                    .map_err(|e| anyhow!("Invalid CAPTCHA_TIMEOUT_SECS: {}", e))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(anyhow!("CAPTCHA_TIMEOUT_SECS must be positive"));
                }
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| anyhow!("Invalid CAPTCHA_TIMEOUT_SECS: {}", e))?
            }
            Err(_) => defaults.timeout,
        };

        let skip_abandoned = env::var("CAPTCHA_SKIP_ABANDONED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let alphabet =
            env::var("CAPTCHA_ALPHABET").unwrap_or_else(|_| DEFAULT_ALPHABET.to_string());
        // Validate early so a bad alphabet fails startup, not the first request
        Vocabulary::new(&alphabet)?;

        let max_upload_bytes = env::var("CAPTCHA_MAX_UPLOAD_BYTES")
            .unwrap_or_else(|_| (2 * 1024 * 1024).to_string())
            .parse()
            .map_err(|e| anyhow!("Invalid CAPTCHA_MAX_UPLOAD_BYTES: {}", e))?;

        Ok(Self {
            api_host,
            api_port,
            model_config: ModelConfig {
                path: PathBuf::from(model_path),
                download_url,
                input_name,
            },
            queue_config: QueueConfig {
                capacity,
                timeout,
                skip_abandoned,
            },
            alphabet,
            max_upload_bytes,
        })
    }

    pub fn vocabulary(&self) -> Result<Vocabulary> {
        Vocabulary::new(&self.alphabet)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

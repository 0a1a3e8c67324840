//! Driver configuration.
//!
//! Buffer-size hints and batching limits live in an explicit [`Config`]
//! passed to the driver at construction, rather than in process-wide state.
//! Everything can be loaded from a TOML file.

use serde::Deserialize;
use std::path::Path;

/// Default fragment cap per vectored write.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Upper bound accepted for `batch_size`.
pub const MAX_BATCH_SIZE: usize = 1024;

/// Largest socket buffer size hint.
pub const MAX_BUF_SIZE: usize = i32::MAX as usize;

/// Socket driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Receive buffer size hint applied to new sockets (e.g., "2MB").
    #[serde(default = "default_buf_size", deserialize_with = "deserialize_buf_size")]
    pub recv_buf_size: usize,

    /// Send buffer size hint applied to new sockets (e.g., "2MB").
    #[serde(default = "default_buf_size", deserialize_with = "deserialize_buf_size")]
    pub send_buf_size: usize,

    /// Maximum number of fragments gathered into one vectored write. Also the
    /// queued-fragment count at which an async submission flushes eagerly.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Listen backlog for listening sockets.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recv_buf_size: default_buf_size(),
            send_buf_size: default_buf_size(),
            batch_size: default_batch_size(),
            backlog: default_backlog(),
        }
    }
}

fn default_buf_size() -> usize {
    2 * 1024 * 1024
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_backlog() -> u32 {
    1024
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(format!(
                "batch_size ({}) must be between 1 and {}",
                self.batch_size, MAX_BATCH_SIZE
            )
            .into());
        }

        for (name, size) in [
            ("recv_buf_size", self.recv_buf_size),
            ("send_buf_size", self.send_buf_size),
        ] {
            if size == 0 || size > MAX_BUF_SIZE {
                return Err(
                    format!("{name} ({size}) must be between 1 and {MAX_BUF_SIZE}").into(),
                );
            }
        }

        if self.backlog == 0 {
            return Err("backlog must be non-zero".into());
        }

        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "sockq=debug".
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log lines.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default)]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Deserialize a socket buffer size given either as a byte count or as a
/// string such as "256KB".
fn deserialize_buf_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BufSize {
        Bytes(usize),
        Text(String),
    }

    match BufSize::deserialize(deserializer)? {
        BufSize::Bytes(n) => Ok(n),
        BufSize::Text(s) => parse_buf_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a socket buffer size: a count followed by an optional `B`, `KB` or
/// `MB` unit (binary multiples, any case). The result must fit the `int`
/// the kernel takes for `SO_RCVBUF`/`SO_SNDBUF`.
pub fn parse_buf_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    let (count, unit) = s.split_at(digits);
    let count: usize = count
        .parse()
        .map_err(|_| format!("invalid buffer size: {s:?}"))?;

    let scale: usize = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        other => return Err(format!("unknown buffer size unit: {other:?}")),
    };

    count
        .checked_mul(scale)
        .filter(|&n| n <= MAX_BUF_SIZE)
        .ok_or_else(|| format!("buffer size {s:?} exceeds {MAX_BUF_SIZE} bytes"))
}

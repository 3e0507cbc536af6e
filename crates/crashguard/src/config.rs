use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::platform::DumpKind;
use crate::stackwalk::DEFAULT_MAX_FRAMES;

/// Name of the optional configuration file, looked up next to the crash handler image.
pub const CONFIG_FILE_NAME: &str = "crashguard.yml";

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the crash handler.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Controls the alert shown after a crash has been recorded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    /// Whether to show the alert at all. Artifacts are written either way.
    pub enabled: bool,
    /// Caption of the alert window.
    pub title: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title: "Crash Error".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File name of the executable whose faults are reported.
    ///
    /// Faults raised by any other image, including this one, are ignored.
    pub target_module: String,

    /// File name of the textual crash report, placed next to the crash handler image.
    pub log_file: String,

    /// File name of the minidump, placed next to the crash handler image.
    pub dump_file: String,

    /// Appends a timestamp and the faulting thread to artifact names, so that consecutive
    /// crashes do not overwrite each other.
    pub unique_artifacts: bool,

    /// Which memory to include in the minidump.
    pub dump_kind: DumpKind,

    /// Maximum number of frames recorded in the call stack.
    pub max_frames: usize,

    /// The crash alert.
    pub alert: AlertConfig,

    /// Configuration for internal logging.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_module: "ffxiv_dx11.exe".to_owned(),
            log_file: "crashguard_appcrash.log".to_owned(),
            dump_file: default_dump_file().to_owned(),
            unique_artifacts: false,
            dump_kind: DumpKind::default(),
            max_frames: DEFAULT_MAX_FRAMES,
            alert: AlertConfig::default(),
            logging: Logging::default(),
        }
    }
}

/// Debug builds write their dumps under a different name, so they are not mixed up with dumps
/// of release builds.
fn default_dump_file() -> &'static str {
    if cfg!(debug_assertions) {
        "crashguard_appcrashd.dmp"
    } else {
        "crashguard_appcrash.dmp"
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    /// Loads the configuration file next to the crash handler image, if there is one.
    ///
    /// A missing file yields the defaults, a broken one is an error.
    pub fn beside_image(image_path: &Path) -> Result<Self> {
        let path = image_path.with_file_name(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::get(Some(&path))
        } else {
            Self::get(None)
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        // check for empty files explicitly
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(E::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_str(LevelFilterVisitor)
}

use crate::gles::Filter;
use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Audio input drivers the recorder knows how to open through FFmpeg.
pub const AUDIO_DRIVERS: [&str; 4] = ["pulse", "alsa", "avfoundation", "dshow"];

/// Command line and file configuration of the filtercam demo
///
/// Example configuration file content
/// # Filtercam configuration
///
/// input = "/dev/video0"
/// input_format = "v4l2"
/// output = "capture.mp4"
/// frame_rate = 30
/// filter = "edge-detect"
///
/// # Audio capture
/// audio_driver = "pulse"
/// audio_device = "default"
///
/// # Stop automatically after this many seconds (optional)
/// duration_secs = 10
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Camera device or media URL to read frames from
    #[arg(short, long, default_value = "/dev/video0")]
    #[serde(default = "default_input")]
    pub input: String,

    /// FFmpeg input format of the source, e.g. v4l2
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_format: Option<String>,

    /// MP4 file the recording is written to
    #[arg(short, long, default_value = "filtercam.mp4")]
    #[serde(default = "default_output")]
    pub output: String,

    /// Recording frame rate
    #[arg(short, long, default_value_t = 30)]
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Filter applied to preview and recording
    #[arg(long, value_enum, default_value_t = Filter::Identity)]
    #[serde(default)]
    pub filter: Filter,

    /// FFmpeg audio input driver
    #[arg(long, default_value = "pulse")]
    #[serde(default = "default_audio_driver")]
    pub audio_driver: String,

    /// Audio device opened by the driver
    #[arg(long, default_value = "default")]
    #[serde(default = "default_audio_device")]
    pub audio_device: String,

    /// Video bit rate per pixel and frame
    #[arg(long, default_value_t = 24)]
    #[serde(default = "default_bits_per_pixel")]
    pub bits_per_pixel: u32,

    /// Stop recording after this many seconds
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: default_input(),
            input_format: None,
            output: default_output(),
            frame_rate: default_frame_rate(),
            filter: Filter::default(),
            audio_driver: default_audio_driver(),
            audio_device: default_audio_device(),
            bits_per_pixel: default_bits_per_pixel(),
            duration_secs: None,
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    pub fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.input == default_input() {
            self.input = file_config.input;
        }
        if self.output == default_output() {
            self.output = file_config.output;
        }
        if self.frame_rate == default_frame_rate() {
            self.frame_rate = file_config.frame_rate;
        }
        if self.filter == Filter::default() {
            self.filter = file_config.filter;
        }
        if self.audio_driver == default_audio_driver() {
            self.audio_driver = file_config.audio_driver;
        }
        if self.audio_device == default_audio_device() {
            self.audio_device = file_config.audio_device;
        }
        if self.bits_per_pixel == default_bits_per_pixel() {
            self.bits_per_pixel = file_config.bits_per_pixel;
        }

        // For Option fields, CLI takes precedence if Some
        if self.input_format.is_none() {
            self.input_format = file_config.input_format;
        }
        if self.duration_secs.is_none() {
            self.duration_secs = file_config.duration_secs;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.input.is_empty() {
            return Err(anyhow::anyhow!("Input cannot be empty"));
        }
        if self.output.is_empty() {
            return Err(anyhow::anyhow!("Output path cannot be empty"));
        }
        if self.frame_rate == 0 {
            return Err(anyhow::anyhow!("Frame rate must be positive"));
        }
        if self.bits_per_pixel == 0 {
            return Err(anyhow::anyhow!("Bits per pixel must be positive"));
        }
        if !AUDIO_DRIVERS.contains(&self.audio_driver.as_str()) {
            return Err(anyhow::anyhow!(
                "Unsupported audio driver: {}. Use one of {}",
                self.audio_driver,
                AUDIO_DRIVERS.join(", ")
            ));
        }
        if self.duration_secs == Some(0) {
            return Err(anyhow::anyhow!("Duration must be positive"));
        }

        Ok(())
    }
}

// Default value functions
fn default_input() -> String {
    "/dev/video0".to_string()
}

fn default_output() -> String {
    "filtercam.mp4".to_string()
}

fn default_frame_rate() -> u32 {
    30
}

fn default_audio_driver() -> String {
    "pulse".to_string()
}

fn default_audio_device() -> String {
    "default".to_string()
}

fn default_bits_per_pixel() -> u32 {
    24
}

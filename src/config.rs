use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::{AudioConfig, BusConfig, CaptureConfig, PlaybackConfig, RecorderConfig, WakeConfig};
use crate::control_bridge::ControlConfig;
use crate::services::WakePhrase;
use crate::services::deepgram::ServiceConfig;

/// 运行时覆盖编译进来的 API key
pub const API_KEY_ENV: &str = "DEEPGRAM_API_KEY";

#[derive(Debug, Error)]
#[error("failed to parse build-time setting {0}")]
pub struct ConfigError(pub &'static str);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub board_type: String,
    pub board_name: String,

    pub audio: AudioConfig,
    pub services: ServiceConfig,
    pub control: ControlConfig,
}

macro_rules! setting {
    ($name:literal) => {
        env!($name).parse().map_err(|_| ConfigError($name))?
    };
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, ConfigError> {
        let phrases: Vec<WakePhrase> =
            serde_json::from_str(env!("WAKE_PHRASES")).map_err(|_| ConfigError("WAKE_PHRASES"))?;

        let mut config = Self {
            app_name: env!("APP_NAME").to_string(),
            app_version: env!("APP_VERSION").to_string(),
            board_type: env!("BOARD_TYPE").to_string(),
            board_name: env!("BOARD_NAME").to_string(),

            audio: AudioConfig {
                // 音频总线
                bus: BusConfig {
                    capture_device: env!("BUS_CAPTURE_DEVICE").to_string(),
                    playback_device: env!("BUS_PLAYBACK_DEVICE").to_string(),
                    sample_rate: setting!("BUS_SAMPLE_RATE"),
                    channels: setting!("BUS_CHANNELS"),
                    capture_bits: setting!("BUS_CAPTURE_BITS"),
                    playback_bits: setting!("BUS_PLAYBACK_BITS"),
                    read_timeout_ms: setting!("BUS_READ_TIMEOUT_MS"),
                    write_timeout_ms: setting!("BUS_WRITE_TIMEOUT_MS"),
                },
                capture: CaptureConfig {
                    block_samples: setting!("CAPTURE_BLOCK_SAMPLES"),
                    sample_shift: setting!("CAPTURE_SAMPLE_SHIFT"),
                    digital_gain: setting!("CAPTURE_DIGITAL_GAIN"),
                    ring_seconds: setting!("CAPTURE_RING_SECONDS"),
                    sequence_quantum_bytes: setting!("CAPTURE_SEQUENCE_QUANTUM_BYTES"),
                },
                wake: WakeConfig {
                    phrases,
                    search_interval_ms: setting!("WAKE_SEARCH_INTERVAL_MS"),
                    min_search_bytes: setting!("WAKE_MIN_SEARCH_BYTES"),
                    search_timeout_ms: setting!("WAKE_SEARCH_TIMEOUT_MS"),
                },
                recorder: RecorderConfig {
                    max_seconds: setting!("RECORDER_MAX_SECONDS"),
                    warmup_ms: setting!("RECORDER_WARMUP_MS"),
                    min_recording_ms: setting!("RECORDER_MIN_RECORDING_MS"),
                    check_interval_ms: setting!("RECORDER_CHECK_INTERVAL_MS"),
                    silence_window_ms: setting!("RECORDER_SILENCE_WINDOW_MS"),
                    baseline_window_ms: setting!("RECORDER_BASELINE_WINDOW_MS"),
                    silence_factor: setting!("RECORDER_SILENCE_FACTOR"),
                    silence_offset: setting!("RECORDER_SILENCE_OFFSET"),
                    required_silent_checks: setting!("RECORDER_REQUIRED_SILENT_CHECKS"),
                    min_command_ms: setting!("RECORDER_MIN_COMMAND_MS"),
                    transcribe_timeout_ms: setting!("RECORDER_TRANSCRIBE_TIMEOUT_MS"),
                },
                playback: PlaybackConfig {
                    chunk_bytes: setting!("PLAYBACK_CHUNK_BYTES"),
                    gain: setting!("PLAYBACK_GAIN"),
                    silence_pad_ms: setting!("PLAYBACK_SILENCE_PAD_MS"),
                    settle_margin_ms: setting!("PLAYBACK_SETTLE_MARGIN_MS"),
                    stream_timeout_ms: setting!("PLAYBACK_STREAM_TIMEOUT_MS"),
                    synthesis_timeout_ms: setting!("PLAYBACK_SYNTHESIS_TIMEOUT_MS"),
                },
            },

            // 远程服务
            services: ServiceConfig {
                base_url: env!("SERVICES_BASE_URL").to_string(),
                api_key: env!("SERVICES_API_KEY").to_string(),
                language: env!("SERVICES_LANGUAGE").to_string(),
                request_timeout_ms: setting!("SERVICES_REQUEST_TIMEOUT_MS"),
            },

            // 本地控制桥
            control: ControlConfig {
                local_ip: env!("CONTROL_LOCAL_IP").to_string(),
                local_port: setting!("CONTROL_LOCAL_PORT"),
                buffer_size: setting!("CONTROL_BUFFER_SIZE"),
                confirm_tone: setting!("CONTROL_CONFIRM_TONE"),
            },
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.services.api_key = key.trim().to_string();
            }
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            log::warn!("{}, using built-in defaults", e);
            Self {
                app_name: env!("APP_NAME").to_string(),
                app_version: env!("APP_VERSION").to_string(),
                board_type: env!("BOARD_TYPE").to_string(),
                board_name: env!("BOARD_NAME").to_string(),
                audio: AudioConfig::default(),
                services: ServiceConfig::default(),
                control: ControlConfig::default(),
            }
        })
    }
}

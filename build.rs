use std::fmt::Display;
use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    bus: Bus,
    capture: Capture,
    wake: Wake,
    recorder: Recorder,
    playback: Playback,
    services: Services,
    control: Control,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Bus {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u32,
    capture_bits: u32,
    playback_bits: u32,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Capture {
    block_samples: usize,
    sample_shift: u32,
    digital_gain: f32,
    ring_seconds: u32,
    sequence_quantum_bytes: usize,
}

#[derive(Deserialize, Serialize)]
struct Phrase {
    phrase: String,
    threshold: f32,
}

#[derive(Deserialize)]
struct Wake {
    phrases: Vec<Phrase>,
    search_interval_ms: u64,
    min_search_bytes: usize,
    search_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Recorder {
    max_seconds: u32,
    warmup_ms: u64,
    min_recording_ms: u64,
    check_interval_ms: u64,
    silence_window_ms: u64,
    baseline_window_ms: u64,
    silence_factor: f32,
    silence_offset: f32,
    required_silent_checks: u32,
    min_command_ms: u64,
    transcribe_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Playback {
    chunk_bytes: usize,
    gain: f32,
    silence_pad_ms: u64,
    settle_margin_ms: u64,
    stream_timeout_ms: u64,
    synthesis_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Services {
    base_url: String,
    api_key: String,
    language: String,
    request_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Control {
    local_ip: String,
    local_port: u16,
    buffer_size: usize,
    confirm_tone: bool,
}

fn emit(key: &str, value: impl Display) {
    println!("cargo:rustc-env={}={}", key, value);
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用和板子信息
    emit("APP_NAME", &config.application.name);
    emit("APP_VERSION", &config.application.version);
    emit("BOARD_TYPE", &config.board.type_);
    emit("BOARD_NAME", &config.board.name);

    // 音频总线
    emit("BUS_CAPTURE_DEVICE", &config.bus.capture_device);
    emit("BUS_PLAYBACK_DEVICE", &config.bus.playback_device);
    emit("BUS_SAMPLE_RATE", config.bus.sample_rate);
    emit("BUS_CHANNELS", config.bus.channels);
    emit("BUS_CAPTURE_BITS", config.bus.capture_bits);
    emit("BUS_PLAYBACK_BITS", config.bus.playback_bits);
    emit("BUS_READ_TIMEOUT_MS", config.bus.read_timeout_ms);
    emit("BUS_WRITE_TIMEOUT_MS", config.bus.write_timeout_ms);

    // 采集
    emit("CAPTURE_BLOCK_SAMPLES", config.capture.block_samples);
    emit("CAPTURE_SAMPLE_SHIFT", config.capture.sample_shift);
    emit("CAPTURE_DIGITAL_GAIN", config.capture.digital_gain);
    emit("CAPTURE_RING_SECONDS", config.capture.ring_seconds);
    emit("CAPTURE_SEQUENCE_QUANTUM_BYTES", config.capture.sequence_quantum_bytes);

    // 唤醒词，短语列表以 JSON 传递
    let phrases = serde_json::to_string(&config.wake.phrases).expect("Failed to encode wake phrases");
    emit("WAKE_PHRASES", phrases);
    emit("WAKE_SEARCH_INTERVAL_MS", config.wake.search_interval_ms);
    emit("WAKE_MIN_SEARCH_BYTES", config.wake.min_search_bytes);
    emit("WAKE_SEARCH_TIMEOUT_MS", config.wake.search_timeout_ms);

    // 命令录音
    emit("RECORDER_MAX_SECONDS", config.recorder.max_seconds);
    emit("RECORDER_WARMUP_MS", config.recorder.warmup_ms);
    emit("RECORDER_MIN_RECORDING_MS", config.recorder.min_recording_ms);
    emit("RECORDER_CHECK_INTERVAL_MS", config.recorder.check_interval_ms);
    emit("RECORDER_SILENCE_WINDOW_MS", config.recorder.silence_window_ms);
    emit("RECORDER_BASELINE_WINDOW_MS", config.recorder.baseline_window_ms);
    emit("RECORDER_SILENCE_FACTOR", config.recorder.silence_factor);
    emit("RECORDER_SILENCE_OFFSET", config.recorder.silence_offset);
    emit("RECORDER_REQUIRED_SILENT_CHECKS", config.recorder.required_silent_checks);
    emit("RECORDER_MIN_COMMAND_MS", config.recorder.min_command_ms);
    emit("RECORDER_TRANSCRIBE_TIMEOUT_MS", config.recorder.transcribe_timeout_ms);

    // 播放
    emit("PLAYBACK_CHUNK_BYTES", config.playback.chunk_bytes);
    emit("PLAYBACK_GAIN", config.playback.gain);
    emit("PLAYBACK_SILENCE_PAD_MS", config.playback.silence_pad_ms);
    emit("PLAYBACK_SETTLE_MARGIN_MS", config.playback.settle_margin_ms);
    emit("PLAYBACK_STREAM_TIMEOUT_MS", config.playback.stream_timeout_ms);
    emit("PLAYBACK_SYNTHESIS_TIMEOUT_MS", config.playback.synthesis_timeout_ms);

    // 远程服务
    emit("SERVICES_BASE_URL", &config.services.base_url);
    emit("SERVICES_API_KEY", &config.services.api_key);
    emit("SERVICES_LANGUAGE", &config.services.language);
    emit("SERVICES_REQUEST_TIMEOUT_MS", config.services.request_timeout_ms);

    // 本地控制桥
    emit("CONTROL_LOCAL_IP", &config.control.local_ip);
    emit("CONTROL_LOCAL_PORT", config.control.local_port);
    emit("CONTROL_BUFFER_SIZE", config.control.buffer_size);
    emit("CONTROL_CONFIRM_TONE", config.control.confirm_tone);
}

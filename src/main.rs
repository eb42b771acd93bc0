use std::sync::Arc;
use std::time::Duration;

use env_logger::Env;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::sync::mpsc;

use halo_voice_rs::audio::{AlsaBus, AudioServices, AudioSystem};
use halo_voice_rs::audio_bridge::{command_channel, event_channel};
use halo_voice_rs::config::Config;
use halo_voice_rs::control_bridge::{ControlBridge, HostRequest};
use halo_voice_rs::controller::{CoreController, LoggingDispatcher};
use halo_voice_rs::services::DeepgramClient;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // 加载配置
    let config = Config::new().unwrap_or_default();
    log::info!(
        "{} {} on {} ({})",
        config.app_name,
        config.app_version,
        config.board_name,
        config.board_type
    );

    // 远程语音服务，唤醒词检索、转写、合成共用一个客户端
    let client = Arc::new(DeepgramClient::new(
        config.services.clone(),
        config.audio.bus.sample_rate,
    )?);
    let services = AudioServices {
        search: client.clone(),
        transcriber: client.clone(),
        synthesizer: client,
    };

    // 控制 -> 音频 命令队列，音频 -> 控制 事件队列
    let (tx_command, rx_command) = command_channel();
    let (tx_event, mut rx_event) = event_channel();

    // 启动音频线程，独占音频总线
    let mut audio = AudioSystem::start(
        config.audio.clone(),
        Box::new(AlsaBus::new()),
        services,
        rx_command,
        tx_event,
        Handle::current(),
    )?;
    let status = audio.status();

    // 启动控制桥，接收宿主和按键的请求
    let (tx_host, mut rx_host) = mpsc::channel::<HostRequest>(16);
    let control_bridge = Arc::new(ControlBridge::new(&config.control, tx_host).await?);
    let control_bridge_clone = control_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = control_bridge_clone.run().await {
            log::error!("ControlBridge error: {}", e);
        }
    });

    let mut controller = CoreController::new(
        tx_command,
        audio.controls(),
        Box::new(LoggingDispatcher),
        config.control.confirm_tone,
    );

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    let mut was_degraded = false;
    log::info!("Voice core started");

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            // 音频线程的唤醒词和转写结果
            Some(event) = rx_event.recv() => {
                controller.handle_audio_event(event).await;
            }

            // 控制桥转来的请求
            Some(request) = rx_host.recv() => {
                controller.handle_host_request(request);
            }

            _ = status_tick.tick() => {
                let degraded = status.is_degraded();
                if degraded != was_degraded {
                    if degraded {
                        log::warn!("Audio bus unavailable, running degraded");
                    } else {
                        log::info!("Audio bus recovered");
                    }
                    was_degraded = degraded;
                }
                log::debug!(
                    "Bus owner {:?}, recording {}, speaking {}",
                    status.bus_owner(),
                    status.is_recording(),
                    status.is_speaking()
                );
            }
        }
    }

    // join 会阻塞，放到阻塞线程池里
    tokio::task::spawn_blocking(move || audio.stop()).await?;
    Ok(())
}

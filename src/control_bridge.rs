//! Local UDP endpoint for the host and physical controls.
//!
//! One request per datagram, e.g. `speak hello there`, `tone confirm`,
//! `record`, `stop`, `cancel`, `volume 0.4`, `gain 1.5`. Every datagram gets
//! an `ok` or `error: ...` reply.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::audio_bridge::ToneKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub local_ip: String,
    pub local_port: u16,
    pub buffer_size: usize,
    /// Play a confirmation tone when the wake word is heard
    pub confirm_tone: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            local_port: 5678,
            buffer_size: 1024,
            confirm_tone: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    Speak(String),
    Tone(ToneKind),
    Record,
    Stop,
    Cancel,
    /// Volume in [0, 1]
    Volume(f32),
    /// Raw gain in [0, 2]
    Gain(f32),
}

impl HostRequest {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        let number = |arg: &str| {
            arg.parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| format!("invalid number '{}'", arg))
        };

        match verb.to_ascii_lowercase().as_str() {
            "speak" if !arg.is_empty() => Ok(HostRequest::Speak(arg.to_string())),
            "speak" => Err("speak needs text".to_string()),
            "tone" => match arg.to_ascii_lowercase().as_str() {
                "confirm" => Ok(HostRequest::Tone(ToneKind::Confirm)),
                "ack" | "acknowledge" => Ok(HostRequest::Tone(ToneKind::Acknowledge)),
                "error" => Ok(HostRequest::Tone(ToneKind::Error)),
                other => Err(format!("unknown tone '{}'", other)),
            },
            "record" => Ok(HostRequest::Record),
            "stop" => Ok(HostRequest::Stop),
            "cancel" => Ok(HostRequest::Cancel),
            "volume" => number(arg).map(HostRequest::Volume),
            "gain" => number(arg).map(HostRequest::Gain),
            "" => Err("empty request".to_string()),
            other => Err(format!("unknown request '{}'", other)),
        }
    }
}

pub struct ControlBridge {
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<HostRequest>,
    buffer_size: usize,
}

impl ControlBridge {
    pub async fn new(config: &ControlConfig, tx: mpsc::Sender<HostRequest>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("{}:{}", config.local_ip, config.local_port)).await?;
        log::info!("Control bridge listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            tx,
            buffer_size: config.buffer_size.max(16),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }

            let reply = match std::str::from_utf8(&buf[..len]) {
                Ok(line) => match HostRequest::parse(line) {
                    Ok(request) => {
                        log::info!("Control request from {}: {:?}", peer, request);
                        if self.tx.send(request).await.is_err() {
                            log::warn!("Controller gone, stopping control bridge");
                            break;
                        }
                        "ok".to_string()
                    }
                    Err(e) => {
                        log::warn!("Bad control request from {}: {}", peer, e);
                        format!("error: {}", e)
                    }
                },
                Err(_) => "error: request is not UTF-8".to_string(),
            };

            if let Err(e) = self.socket.send_to(reply.as_bytes(), peer).await {
                log::warn!("Failed to reply to {}: {}", peer, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_request() {
        assert_eq!(
            HostRequest::parse("speak  hello there "),
            Ok(HostRequest::Speak("hello there".into()))
        );
        assert_eq!(HostRequest::parse("tone ack"), Ok(HostRequest::Tone(ToneKind::Acknowledge)));
        assert_eq!(HostRequest::parse("TONE Confirm"), Ok(HostRequest::Tone(ToneKind::Confirm)));
        assert_eq!(HostRequest::parse("record"), Ok(HostRequest::Record));
        assert_eq!(HostRequest::parse("stop\n"), Ok(HostRequest::Stop));
        assert_eq!(HostRequest::parse("cancel"), Ok(HostRequest::Cancel));
        assert_eq!(HostRequest::parse("volume 0.4"), Ok(HostRequest::Volume(0.4)));
        assert_eq!(HostRequest::parse("gain 1.5"), Ok(HostRequest::Gain(1.5)));
    }

    #[test]
    fn rejects_malformed_requests() {
        assert!(HostRequest::parse("").is_err());
        assert!(HostRequest::parse("speak").is_err());
        assert!(HostRequest::parse("tone siren").is_err());
        assert!(HostRequest::parse("volume loud").is_err());
        assert!(HostRequest::parse("gain NaN").is_err());
        assert!(HostRequest::parse("dance").is_err());
    }

    #[tokio::test]
    async fn forwards_requests_and_replies() {
        let config = ControlConfig {
            local_port: 0,
            ..ControlConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(4);
        let bridge = Arc::new(ControlBridge::new(&config, tx).await.unwrap());
        let addr = bridge.local_addr().unwrap();
        let runner = bridge.clone();
        tokio::spawn(async move { runner.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut reply = [0u8; 64];

        client.send_to(b"tone error", addr).await.unwrap();
        let (n, _) = client.recv_from(&mut reply).await.unwrap();
        assert_eq!(&reply[..n], b"ok");
        assert_eq!(rx.recv().await, Some(HostRequest::Tone(ToneKind::Error)));

        client.send_to(b"fly", addr).await.unwrap();
        let (n, _) = client.recv_from(&mut reply).await.unwrap();
        assert!(reply[..n].starts_with(b"error:"));
    }
}

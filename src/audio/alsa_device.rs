//! Opens the ALSA PCM behind the bus in whichever direction the current
//! owner needs.

use alsa::ValueOr;
use alsa::pcm::{Access, Format, HwParams, PCM};
use anyhow::{Context, Result, bail};

use super::bus::{Direction, PeripheralSettings};

/// What the hardware actually agreed to.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per hardware period
    pub period_frames: usize,
}

fn sample_format(settings: &PeripheralSettings) -> Result<Format> {
    match (settings.direction, settings.bits_per_sample) {
        (_, 16) => Ok(Format::S16LE),
        // I2S MEMS 麦克风输出 32 位容器
        (Direction::Input, 32) => Ok(Format::S32LE),
        (direction, bits) => bail!("{} bit samples not supported for {:?}", bits, direction),
    }
}

/// Open and configure the PCM for `settings`. Playback streams are prepared
/// so the first write does not stall.
pub fn open(settings: &PeripheralSettings) -> Result<(PCM, Negotiated)> {
    let format = sample_format(settings)?;
    let alsa_direction = match settings.direction {
        Direction::Input => alsa::Direction::Capture,
        Direction::Output => alsa::Direction::Playback,
    };

    let pcm = PCM::new(&settings.device, alsa_direction, false).with_context(|| {
        format!("cannot open '{}' for {:?}", settings.device, settings.direction)
    })?;

    {
        let hw = HwParams::any(&pcm).context("no hardware parameter space")?;
        hw.set_access(Access::RWInterleaved)?;
        hw.set_format(format)
            .with_context(|| format!("'{}' rejects {:?}", settings.device, format))?;
        hw.set_channels(settings.channels)?;
        hw.set_rate_near(settings.sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hw)?;
    }

    let negotiated = {
        let hw = pcm.hw_params_current()?;
        Negotiated {
            sample_rate: hw.get_rate()?,
            channels: hw.get_channels()?,
            period_frames: hw.get_period_size()? as usize,
        }
    };

    if negotiated.sample_rate != settings.sample_rate {
        log::warn!(
            "'{}' runs at {}Hz instead of {}Hz",
            settings.device,
            negotiated.sample_rate,
            settings.sample_rate
        );
    }
    if settings.direction == Direction::Output {
        pcm.prepare()?;
    }

    log::info!(
        "ALSA {:?} open: device={}, format={:?}, rate={}, channels={}, period={}",
        settings.direction,
        settings.device,
        format,
        negotiated.sample_rate,
        negotiated.channels,
        negotiated.period_frames,
    );
    Ok((pcm, negotiated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(direction: Direction, bits: u32) -> PeripheralSettings {
        PeripheralSettings {
            direction,
            device: "default".into(),
            sample_rate: 16000,
            bits_per_sample: bits,
            channels: 1,
        }
    }

    #[test]
    fn container_width_selects_format() {
        assert_eq!(sample_format(&settings(Direction::Input, 32)).unwrap(), Format::S32LE);
        assert_eq!(sample_format(&settings(Direction::Input, 16)).unwrap(), Format::S16LE);
        assert_eq!(sample_format(&settings(Direction::Output, 16)).unwrap(), Format::S16LE);
        assert!(sample_format(&settings(Direction::Output, 32)).is_err());
        assert!(sample_format(&settings(Direction::Input, 24)).is_err());
    }
}

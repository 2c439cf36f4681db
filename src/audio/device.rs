//! Audio device enumeration and selection

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::config::{DeviceConfig, DeviceSelector};
use crate::error::AudioError;

/// Which side of a device a selector refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Serializable description of a device
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub index: usize,
    pub name: String,
    pub direction: &'static str,
    pub is_default: bool,
    pub default_sample_rate: Option<u32>,
    pub default_channels: Option<u16>,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

fn devices(host: &cpal::Host, direction: Direction) -> Result<Vec<cpal::Device>, AudioError> {
    let devices: Vec<cpal::Device> = match direction {
        Direction::Input => host.input_devices()?.collect(),
        Direction::Output => host.output_devices()?.collect(),
    };
    Ok(devices)
}

fn default_device(host: &cpal::Host, direction: Direction) -> Option<cpal::Device> {
    match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    }
}

/// Resolve a selector to a cpal device
pub fn find_device(selector: &DeviceSelector, direction: Direction) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let not_found = || AudioError::DeviceNotFound(format!("{} {}", direction.as_str(), selector));

    if selector.is_default() {
        return default_device(&host, direction).ok_or_else(not_found);
    }

    let mut candidates = devices(&host, direction)?;
    match selector {
        DeviceSelector::Index(index) if *index < candidates.len() => Ok(candidates.swap_remove(*index)),
        DeviceSelector::Index(_) => Err(not_found()),
        DeviceSelector::Name(name) => candidates
            .into_iter()
            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(not_found),
    }
}

pub fn find_input_device(selector: &DeviceSelector) -> Result<cpal::Device, AudioError> {
    find_device(selector, Direction::Input)
}

pub fn find_output_device(selector: &DeviceSelector) -> Result<cpal::Device, AudioError> {
    find_device(selector, Direction::Output)
}

fn default_config(
    device: &cpal::Device,
    direction: Direction,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let config = match direction {
        Direction::Input => device.default_input_config()?,
        Direction::Output => device.default_output_config()?,
    };
    Ok(config)
}

/// Configured sample rate, or the device default when unset
pub fn resolve_sample_rate(config: &DeviceConfig, direction: Direction) -> Result<u32, AudioError> {
    if let Some(rate) = config.samplerate {
        return Ok(rate);
    }
    let device = find_device(&config.device, direction)?;
    let rate = default_config(&device, direction)?.sample_rate().0;
    tracing::debug!("Resolved {} sample rate to {}Hz", direction.as_str(), rate);
    Ok(rate)
}

/// Common rates a supported config range covers, and its channel counts
fn capabilities(ranges: Vec<cpal::SupportedStreamConfigRange>) -> (Vec<u32>, Vec<u16>) {
    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for range in ranges {
        for rate in [8000u32, 16000, 22050, 32000, 44100, 48000, 88200, 96000, 192000] {
            if (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&rate)
                && !rates.contains(&rate)
            {
                rates.push(rate);
            }
        }
        if !channels.contains(&range.channels()) {
            channels.push(range.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

fn describe(
    index: usize,
    device: &cpal::Device,
    direction: Direction,
    default_name: Option<&str>,
) -> AudioDeviceInfo {
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let default = default_config(device, direction).ok();
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device.supported_input_configs().map(|c| c.collect()),
        Direction::Output => device.supported_output_configs().map(|c| c.collect()),
    }
    .unwrap_or_default();
    let (sample_rates, channels) = capabilities(ranges);

    AudioDeviceInfo {
        index,
        is_default: default_name == Some(name.as_str()),
        name,
        direction: direction.as_str(),
        default_sample_rate: default.as_ref().map(|c| c.sample_rate().0),
        default_channels: default.as_ref().map(|c| c.channels()),
        sample_rates,
        channels,
    }
}

/// List all devices on the default host for one direction
pub fn list_devices(direction: Direction) -> Result<Vec<AudioDeviceInfo>, AudioError> {
    let host = cpal::default_host();
    let default_name = default_device(&host, direction).and_then(|d| d.name().ok());
    Ok(devices(&host, direction)?
        .iter()
        .enumerate()
        .map(|(index, device)| describe(index, device, direction, default_name.as_deref()))
        .collect())
}

/// Describe the device a selector resolves to
pub fn device_info(selector: &DeviceSelector, direction: Direction) -> Result<AudioDeviceInfo, AudioError> {
    let device = find_device(selector, direction)?;
    let name = device.name().ok();
    let index = list_devices(direction)?
        .into_iter()
        .find(|d| Some(&d.name) == name.as_ref())
        .map(|d| d.index)
        .unwrap_or_default();
    let host = cpal::default_host();
    let default_name = default_device(&host, direction).and_then(|d| d.name().ok());
    Ok(describe(index, &device, direction, default_name.as_deref()))
}

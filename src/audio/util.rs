//! Device lookup and stream configuration helpers.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host, SupportedStreamConfig, SupportedStreamConfigRange};

use crate::codec::SampleFormat;
use crate::error::CaptureError;

/// Get a human-readable device name.
///
/// # Returns
/// Device name string, or "Unknown" if the name cannot be retrieved.
pub fn get_device_name(device: &Device) -> String {
    device.description().ok().map(|desc| desc.name().to_string()).unwrap_or_else(|| "Unknown".to_string())
}

/// Map a relay sample format to the cpal one.
pub fn cpal_format(format: SampleFormat) -> cpal::SampleFormat {
    match format {
        SampleFormat::I16 => cpal::SampleFormat::I16,
        SampleFormat::I32 => cpal::SampleFormat::I32,
        SampleFormat::F32 => cpal::SampleFormat::F32,
    }
}

/// Find an input device by exact name, or the default input device.
///
/// # Errors
/// Returns [`CaptureError::DeviceNotFound`] if no input device has that name,
/// or [`CaptureError::NoInputDevice`] if no name was given and the host has
/// no default input.
pub fn find_input_device(host: &Host, name: Option<&str>) -> Result<Device, CaptureError> {
    let Some(name) = name else {
        return host.default_input_device().ok_or(CaptureError::NoInputDevice);
    };

    let devices = host.input_devices().map_err(|e| CaptureError::Enumerate(e.to_string()))?;
    for device in devices {
        if get_device_name(&device) == name {
            return Ok(device);
        }
    }

    Err(CaptureError::DeviceNotFound(name.to_string()))
}

/// Find a configuration that matches the requested stream exactly.
///
/// The relay neither resamples nor converts channels or sample formats, so a
/// range is only accepted if it has the same channel count and sample format
/// and its rate range contains `sample_rate`.
pub fn find_matching_config(
    configs: impl Iterator<Item = SupportedStreamConfigRange>,
    sample_rate: u32,
    channels: u16,
    format: SampleFormat,
) -> Option<SupportedStreamConfig> {
    let wanted = cpal_format(format);

    configs
        .filter(|c| c.channels() == channels && c.sample_format() == wanted)
        .find(|c| c.min_sample_rate() <= sample_rate && sample_rate <= c.max_sample_rate())
        .map(|c| c.with_sample_rate(sample_rate))
}

/// Summary of one input device for `--list-devices`.
#[derive(Debug, Clone)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub default_config: Option<String>,
}

/// Enumerate the host's input devices.
pub fn list_input_devices(host: &Host) -> Result<Vec<InputDeviceInfo>, CaptureError> {
    let default_name = host.default_input_device().map(|d| get_device_name(&d));
    let devices = host.input_devices().map_err(|e| CaptureError::Enumerate(e.to_string()))?;

    Ok(devices
        .map(|device| {
            let name = get_device_name(&device);
            let default_config = device
                .default_input_config()
                .ok()
                .map(|c| format!("{} Hz, {} channel(s), {:?}", c.sample_rate(), c.channels(), c.sample_format()));
            InputDeviceInfo { is_default: default_name.as_deref() == Some(name.as_str()), name, default_config }
        })
        .collect())
}

/// Print available input devices to stdout.
pub fn print_input_devices() -> Result<(), CaptureError> {
    let host = cpal::default_host();
    let devices = list_input_devices(&host)?;

    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }

    println!("Input devices:");
    for device in devices {
        let marker = if device.is_default { "*" } else { " " };
        match device.default_config {
            Some(config) => println!(" {} {} ({})", marker, device.name, config),
            None => println!(" {} {}", marker, device.name),
        }
    }
    Ok(())
}

//! Output device discovery, selection and monitoring.
//!
//! Thin wrappers around cpal for:
//! - listing output devices
//! - selecting the default device or a device by substring match
//! - choosing a stream config for the engine's sample rate
//! - noticing when the host's default output device changes

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::sync::Semaphore;

/// Pick the first output device whose name contains `needle` (case-insensitive), or the host
/// default when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"));
    };

    host.output_devices()
        .context("No output devices")?
        .find(|d| {
            d.description()
                .map(|desc| matches_device_name(&desc.name(), needle))
                .unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("No output device matched: {needle}"))
}

/// Choose the output config closest to `target_rate`.
///
/// Prefers an exact match, then the highest rate below the target, then the lowest rate above
/// it. Within one rate, float formats win over integer ones.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            exact: rate == target_rate,
            below: rate <= target_rate,
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        if best.as_ref().is_none_or(|(b, _)| candidate.beats(b)) {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Largest fixed buffer size the device allows, capped so pause/stop stay responsive.
///
/// `None` leaves the choice to the device.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 4096;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Names of the host's output devices, in enumeration order.
pub fn list_output_devices(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.to_string());
    }
    Ok(names)
}

/// Stable identity of the host's current default output device.
pub fn default_output_key(host: &cpal::Host) -> Option<String> {
    let device = host.default_output_device()?;
    if let Ok(id) = device.id() {
        return Some(id.to_string());
    }
    device.description().ok().map(|d| d.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidate {
    exact: bool,
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        if self.exact != other.exact {
            return self.exact;
        }
        if self.below != other.below {
            return self.below;
        }
        if self.rate != other.rate {
            // Below the target: closer means higher. Above it: closer means lower.
            return if self.below {
                self.rate > other.rate
            } else {
                self.rate < other.rate
            };
        }
        self.format_rank < other.format_rank
    }
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

/// Background poller for default output device changes.
///
/// Calls `on_change` from its own thread whenever the default device identity differs from the
/// previous poll. Dropping the watcher stops and joins the thread.
pub struct DeviceWatcher {
    stop: Arc<Semaphore>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    pub fn spawn<F>(interval: Duration, on_change: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        Self::spawn_with_probe(interval, || default_output_key(&cpal::default_host()), on_change)
    }

    /// Like [`DeviceWatcher::spawn`], with a custom probe for the current device identity.
    pub fn spawn_with_probe<P, F>(interval: Duration, probe: P, on_change: F) -> Result<Self>
    where
        P: Fn() -> Option<String> + Send + 'static,
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new(Semaphore::new(0));
        let stop_thread = stop.clone();
        let handle = thread::Builder::new()
            .name("audio-device-watch".to_string())
            .spawn(move || {
                let mut current = probe();
                tracing::debug!(device = ?current, "watching default output device");
                while !stop_thread.wait_timeout(interval) {
                    let next = probe();
                    if next != current {
                        tracing::info!(
                            from = ?current,
                            to = ?next,
                            "default output device changed"
                        );
                        current = next;
                        on_change();
                    }
                }
            })
            .context("spawn device watcher")?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("device watcher exited by panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn clamp_rate_keeps_target_in_range() {
        assert_eq!(clamp_rate(8_000, 192_000, 44_100), 44_100);
        assert_eq!(clamp_rate(48_000, 96_000, 44_100), 48_000);
        assert_eq!(clamp_rate(8_000, 32_000, 44_100), 32_000);
    }

    fn candidate(rate: u32, format_rank: u8) -> Candidate {
        Candidate {
            exact: rate == 44_100,
            below: rate <= 44_100,
            rate,
            format_rank,
        }
    }

    #[test]
    fn exact_rate_beats_everything() {
        assert!(candidate(44_100, 3).beats(&candidate(32_000, 0)));
        assert!(!candidate(48_000, 0).beats(&candidate(44_100, 3)));
    }

    #[test]
    fn closer_rates_win_on_each_side() {
        assert!(candidate(32_000, 0).beats(&candidate(22_050, 0)));
        assert!(candidate(48_000, 0).beats(&candidate(96_000, 0)));
        assert!(candidate(22_050, 0).beats(&candidate(48_000, 0)));
    }

    #[test]
    fn float_format_breaks_ties() {
        assert!(candidate(44_100, 0).beats(&candidate(44_100, 2)));
        assert_eq!(sample_format_rank(cpal::SampleFormat::F32), 0);
    }

    #[test]
    fn watcher_reports_identity_changes() {
        let identity = Arc::new(Mutex::new(Some("speakers".to_string())));
        let changes = Arc::new(AtomicUsize::new(0));

        let probe_identity = identity.clone();
        let changes_cb = changes.clone();
        let watcher = DeviceWatcher::spawn_with_probe(
            Duration::from_millis(5),
            move || probe_identity.lock().unwrap().clone(),
            move || {
                changes_cb.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        *identity.lock().unwrap() = Some("headphones".to_string());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while changes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(watcher);
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }
}

use anyhow::{Context, Result};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use ups_hid_types::ReportType;
use ups_hid_usb::device::libusb::DeviceFilter;
use ups_hid_usb::poller::{DEFAULT_REPORT_IDS, DEFAULT_REPORT_LENGTH};
use ups_hid_usb::session::{MonitorSettings, DEFAULT_REPORT_DESCRIPTOR_LENGTH};

// Anything faster than this is hammering the control endpoint for no gain
const MIN_POLL_INTERVAL_MS: u64 = 50;

// libusb treats a zero timeout as no timeout at all
const MIN_TIMEOUT_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,

    pub report_ids: Vec<u8>,
    pub report_type: ReportType,
    pub derive_report_ids: bool,

    pub fetch_report_descriptor: bool,
    pub report_descriptor_length: u16,

    pub poll_interval_ms: u64,
    pub report_timeout_ms: u64,
    pub descriptor_timeout_ms: u64,
    pub report_length: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
            report_ids: DEFAULT_REPORT_IDS.to_vec(),
            report_type: ReportType::Input,
            derive_report_ids: false,
            fetch_report_descriptor: true,
            report_descriptor_length: DEFAULT_REPORT_DESCRIPTOR_LENGTH,
            poll_interval_ms: 1000,
            report_timeout_ms: 300,
            descriptor_timeout_ms: 2000,
            report_length: DEFAULT_REPORT_LENGTH,
        }
    }
}

impl Settings {
    /// Reads the settings, then writes them straight back so new keys show up in the file.
    pub fn load(path: &Path) -> Result<Settings> {
        let settings = Settings::read(path)?;
        if let Err(e) = settings.write(path) {
            error!("Couldn't save settings to {}: {}", path.to_string_lossy(), e);
        }
        settings.check();
        Ok(settings)
    }

    pub fn read(path: &Path) -> Result<Settings> {
        match File::open(path) {
            Ok(reader) => serde_json::from_reader(reader).context(format!(
                "Could not parse daemon settings file at {}",
                path.to_string_lossy()
            )),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Settings::default()),
            Err(error) => Err(error).context(format!(
                "Could not open daemon settings file for reading at {}",
                path.to_string_lossy()
            )),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if let Err(e) = create_dir_all(parent) {
                if e.kind() != ErrorKind::AlreadyExists {
                    return Err(e).context(format!(
                        "Could not create settings directory at {}",
                        parent.to_string_lossy()
                    ))?;
                }
            }
        }
        let writer = File::create(path).context(format!(
            "Could not open daemon settings file for writing at {}",
            path.to_string_lossy()
        ))?;
        serde_json::to_writer_pretty(writer, self).context(format!(
            "Could not write to daemon settings file at {}",
            path.to_string_lossy()
        ))?;
        Ok(())
    }

    fn check(&self) {
        if self.report_ids.is_empty() && !self.derive_report_ids {
            warn!("No report IDs configured, nothing will be polled");
        }
        if self.derive_report_ids && !self.fetch_report_descriptor {
            warn!("derive_report_ids needs fetch_report_descriptor, using the configured IDs");
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            warn!(
                "poll_interval_ms of {} is too short, using {}",
                self.poll_interval_ms, MIN_POLL_INTERVAL_MS
            );
        }
        for (key, value) in [
            ("report_timeout_ms", self.report_timeout_ms),
            ("descriptor_timeout_ms", self.descriptor_timeout_ms),
        ] {
            if value < MIN_TIMEOUT_MS {
                warn!("{} of {} is too short, using {}", key, value, MIN_TIMEOUT_MS);
            }
        }
    }

    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            report_ids: self.report_ids.clone(),
            report_type: self.report_type,
            derive_report_ids: self.derive_report_ids,
            fetch_report_descriptor: self.fetch_report_descriptor,
            report_descriptor_length: self.report_descriptor_length,
            report_length: self.report_length,
            descriptor_timeout: timeout(self.descriptor_timeout_ms),
            report_timeout: timeout(self.report_timeout_ms),
        }
    }
}

fn timeout(millis: u64) -> Duration {
    Duration::from_millis(millis.max(MIN_TIMEOUT_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("ups-hid-daemon-{}-{}", std::process::id(), name))
            .join("settings.json")
    }

    #[test]
    fn defaults_poll_the_known_ids() {
        let settings = Settings::default();
        assert_eq!(settings.report_ids, vec![0x01, 0x64, 0x66]);
        assert_eq!(settings.report_type, ReportType::Input);
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));

        let monitor = settings.monitor_settings();
        assert_eq!(monitor.report_timeout, Duration::from_millis(300));
        assert_eq!(monitor.descriptor_timeout, Duration::from_millis(2000));
        assert_eq!(monitor.report_length, 64);
        assert_eq!(monitor.report_descriptor_length, 512);
        assert!(!settings.device_filter().has_ids());
    }

    #[test]
    fn missing_keys_take_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{ "vendor_id": 1892, "report_ids": [12, 22], "report_type": "Feature" }"#,
        )
        .unwrap();

        assert_eq!(settings.vendor_id, Some(0x0764));
        assert_eq!(settings.product_id, None);
        assert_eq!(settings.report_ids, vec![12, 22]);
        assert_eq!(settings.report_type, ReportType::Feature);
        assert_eq!(settings.poll_interval_ms, 1000);
        assert!(settings.fetch_report_descriptor);
        assert!(settings.device_filter().matches_ids(0x0764, 0x0501));
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let settings = Settings {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            settings.poll_interval(),
            Duration::from_millis(MIN_POLL_INTERVAL_MS)
        );
    }

    #[test]
    fn zero_timeouts_are_raised_to_the_floor() {
        let settings: Settings =
            serde_json::from_str(r#"{ "report_timeout_ms": 0, "descriptor_timeout_ms": 0 }"#)
                .unwrap();

        let monitor = settings.monitor_settings();
        assert_eq!(monitor.report_timeout, Duration::from_millis(MIN_TIMEOUT_MS));
        assert_eq!(
            monitor.descriptor_timeout,
            Duration::from_millis(MIN_TIMEOUT_MS)
        );
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let path = scratch_path("load");
        let _ = std::fs::remove_file(&path);

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(path.exists());

        let mut changed = settings.clone();
        changed.derive_report_ids = true;
        changed.write(&path).unwrap();
        assert_eq!(Settings::read(&path).unwrap(), changed);

        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn bad_json_is_an_error() {
        let path = scratch_path("bad");
        if let Some(parent) = path.parent() {
            create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, "{ not json").unwrap();

        assert!(Settings::read(&path).is_err());

        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}

//! Device conditions: network class, screen state and OS version
//!
//! The orchestrator re-applies rules whenever these change. [`SystemProbe`]
//! reads them from the host:
//!
//! - network class from interface names (`wlan*` → Wi-Fi, `rmnet*`/`ccmni*` → mobile)
//!   plus `gsm.operator.isroaming`
//! - screen state from backlight brightness under `/sys/class/backlight`
//! - SDK level from `ro.build.version.sdk`

use crate::core::error::{Error, Result};
use crate::core::rule::NetworkClass;
use crate::shell::run_with_timeout;
use async_trait::async_trait;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Inputs to rule evaluation that come from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceConditions {
    pub network: NetworkClass,
    pub screen_on: bool,
}

impl Default for DeviceConditions {
    fn default() -> Self {
        Self {
            network: NetworkClass::None,
            screen_on: true,
        }
    }
}

#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn sdk_version(&self) -> Result<u32>;
    async fn conditions(&self) -> DeviceConditions;
}

const WIFI_PREFIXES: [&str; 3] = ["wlan", "wl", "swlan"];
const MOBILE_PREFIXES: [&str; 5] = ["rmnet", "ccmni", "wwan", "seth", "pdp"];
const WIRED_PREFIXES: [&str; 2] = ["eth", "en"];

/// Classifies the uplink from the names of interfaces that carry an address.
///
/// Wi-Fi wins over mobile (the OS prefers it for app traffic). Wired
/// ethernet is treated like Wi-Fi since both are unmetered.
pub fn classify_interfaces<'a>(
    names: impl IntoIterator<Item = &'a str>,
    roaming: bool,
) -> NetworkClass {
    let mut mobile = false;
    for name in names {
        if WIFI_PREFIXES.iter().any(|p| name.starts_with(p))
            || WIRED_PREFIXES.iter().any(|p| name.starts_with(p))
        {
            return NetworkClass::Wifi;
        }
        if MOBILE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            mobile = true;
        }
    }
    match (mobile, roaming) {
        (true, true) => NetworkClass::Roaming,
        (true, false) => NetworkClass::Mobile,
        (false, _) => NetworkClass::None,
    }
}

/// Probe backed by sysfs, `getprop` and interface enumeration
#[derive(Debug, Clone)]
pub struct SystemProbe {
    timeout: Duration,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl SystemProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn getprop(&self, name: &str) -> Result<String> {
        let output = run_with_timeout("getprop", &[name], None, self.timeout, "getprop")
            .await?
            .check(Error::Unavailable)?;
        Ok(output.stdout.trim().to_string())
    }

    async fn roaming(&self) -> bool {
        match self.getprop("gsm.operator.isroaming").await {
            // Multi-SIM devices report one value per slot
            Ok(value) => value.split(',').any(|v| v.trim() == "true"),
            Err(_) => false,
        }
    }

    async fn screen_on(&self) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir("/sys/class/backlight").await else {
            return true;
        };
        let mut seen = false;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path().join("brightness");
            if let Ok(value) = tokio::fs::read_to_string(&path).await {
                seen = true;
                if value.trim().parse::<u32>().is_ok_and(|b| b > 0) {
                    return true;
                }
            }
        }
        // No readable backlight: assume the screen is on
        !seen
    }
}

#[async_trait]
impl DeviceProbe for SystemProbe {
    async fn sdk_version(&self) -> Result<u32> {
        let value = self.getprop("ro.build.version.sdk").await?;
        value
            .parse::<u32>()
            .map_err(|_| Error::Unavailable(format!("unexpected SDK value {value:?}")))
    }

    async fn conditions(&self) -> DeviceConditions {
        let interfaces = match NetworkInterface::show() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Failed to enumerate network interfaces: {}", e);
                Vec::new()
            }
        };
        let up: Vec<&str> = interfaces
            .iter()
            .filter(|i| i.name != "lo" && !i.addr.is_empty())
            .map(|i| i.name.as_str())
            .collect();
        debug!("Interfaces with addresses: {:?}", up);

        let network = classify_interfaces(up.iter().copied(), self.roaming().await);
        DeviceConditions {
            network,
            screen_on: self.screen_on().await,
        }
    }
}

/// Polls `probe` every `interval` and publishes changes.
pub fn spawn_condition_watch(
    probe: std::sync::Arc<dyn DeviceProbe>,
    initial: DeviceConditions,
    interval: Duration,
) -> (watch::Receiver<DeviceConditions>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(initial);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let current = probe.conditions().await;
            tx.send_if_modified(|c| {
                if *c == current {
                    false
                } else {
                    debug!("Device conditions changed: {:?}", current);
                    *c = current;
                    true
                }
            });
            if tx.is_closed() {
                break;
            }
        }
    });
    (rx, handle)
}

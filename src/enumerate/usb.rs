use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{unused_random_id, GenerationToken};
use crate::model::{DeviceInfo, UsbPid};
use crate::ports::{DeviceHandle, UsbScan, UsbScanner};

/// Listing entry for one USB device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbSummary {
    pub pid: Option<UsbPid>,
    pub name: String,
    pub serial: Option<u32>,
}

/// Handle and identity behind one USB identifier
#[derive(Clone)]
pub struct UsbEntry {
    pub device: Arc<dyn DeviceHandle>,
    pub info: DeviceInfo,
}

#[derive(Default)]
struct UsbState {
    caching: bool,
    cached_scan: Option<UsbScan>,
    listed: Option<GenerationToken>,
    devices: BTreeMap<String, UsbEntry>,
    summaries: BTreeMap<String, UsbSummary>,
}

/// Enumerates YubiKeys attached over USB
pub struct UsbEnumerator {
    scanner: Arc<dyn UsbScanner>,
    state: Mutex<UsbState>,
}

impl UsbEnumerator {
    pub fn new(scanner: Arc<dyn UsbScanner>) -> Self {
        Self {
            scanner,
            state: Mutex::new(UsbState::default()),
        }
    }

    pub fn scanner(&self) -> &Arc<dyn UsbScanner> {
        &self.scanner
    }

    /// Probe the bus, reusing one probe for the whole caching scope
    ///
    /// A failing probe reads as an empty bus.
    pub fn scan(&self) -> UsbScan {
        {
            let state = self.state.lock();
            if state.caching {
                if let Some(scan) = &state.cached_scan {
                    return scan.clone();
                }
            }
        }

        let scan = self.scanner.scan_devices().unwrap_or_else(|e| {
            warn!("USB scan failed: {}", e);
            UsbScan::default()
        });

        let mut state = self.state.lock();
        if state.caching {
            state.cached_scan = Some(scan.clone());
        }
        scan
    }

    pub fn token(&self) -> GenerationToken {
        GenerationToken::of(&self.scan())
    }

    /// Identifier to summary mapping, rebuilt only when the token changed
    pub fn list(&self) -> BTreeMap<String, UsbSummary> {
        let token = self.token();
        let mut state = self.state.lock();
        if state.listed != Some(token) {
            state.devices.clear();
            state.summaries.clear();
            match self.scanner.list_all_devices() {
                Ok(devices) => {
                    for (device, info) in devices {
                        let id = match info.serial {
                            Some(serial) if !state.devices.contains_key(&serial.to_string()) => {
                                serial.to_string()
                            }
                            _ => unused_random_id(&state.devices),
                        };
                        let pid = device.pid();
                        let summary = UsbSummary {
                            pid,
                            name: info.display_name(pid.and_then(UsbPid::key_type)),
                            serial: info.serial,
                        };
                        debug!("USB device {}: {:?}", id, summary);
                        state.summaries.insert(id.clone(), summary);
                        state.devices.insert(id, UsbEntry { device, info });
                    }
                    info!("USB device set changed, {} device(s)", state.devices.len());
                    state.listed = Some(token);
                }
                Err(e) => {
                    warn!("Listing USB devices failed: {}", e);
                    state.listed = None;
                }
            }
        }
        state.summaries.clone()
    }

    /// Entry for an identifier issued by the current generation
    pub fn resolve(&self, id: &str) -> Option<UsbEntry> {
        self.state.lock().devices.get(id).cloned()
    }

    /// Start reusing a single probe; must not be nested
    pub fn begin_caching(&self) {
        let mut state = self.state.lock();
        if state.caching {
            warn!("USB caching scope entered twice");
        }
        state.caching = true;
        state.cached_scan = None;
    }

    pub fn end_caching(&self) {
        let mut state = self.state.lock();
        state.caching = false;
        state.cached_scan = None;
    }

    /// Run `f` inside a caching scope
    pub fn with_caching<R>(&self, f: impl FnOnce() -> R) -> R {
        self.begin_caching();
        let result = f();
        self.end_caching();
        result
    }
}

//! Device discovery over mDNS/DNS-SD.
//!
//! Companion devices advertise an `_http._tcp` service whose instance name
//! is `<product>:<phone name>:<phone id>`. The resolver daemon is an
//! external collaborator, this module turns its browse events into a live
//! set of addressable records.

use crate::error::DiscoveryError;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use regex::Regex;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::LazyLock,
    time::Duration,
};

pub const SERVICE_TYPE: &str = "_http._tcp.local.";

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DiscoveredDevice {
    pub name: String,
    pub host: String,
    pub ipv4: Option<Ipv4Addr>,
    pub port: u16,
    pub txt_records: HashMap<String, String>,
}
impl DiscoveredDevice {
    pub fn phone_name(&self) -> Option<&str> {
        self.name.split(':').nth(1)
    }
    pub fn phone_id(&self) -> Option<&str> {
        self.name.split(':').nth(2)
    }

    /// Address usable for the control api, preferring the resolved ipv4.
    pub fn address(&self) -> String {
        match self.ipv4 {
            Some(ipv4) => ipv4.to_string(),
            None => self.host.trim_end_matches('.').to_owned(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DiscoveryEvent {
    Added(DiscoveredDevice),
    Removed(String),
}

fn instance_name_matches(name: &str) -> bool {
    static PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[^:]+:[^:]+:[^:]+$").unwrap());
    PATTERN.is_match(name)
}

fn instance_name(fullname: &str) -> Option<&str> {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|name| name.trim_end_matches('.'))
}

fn record_from_info(info: &ServiceInfo) -> Option<DiscoveredDevice> {
    let name = instance_name(info.get_fullname())?.to_owned();

    let ipv4 = info.get_addresses().iter().find_map(|address| match address {
        IpAddr::V4(ipv4) => Some(*ipv4),
        IpAddr::V6(_) => None,
    });

    let txt_records = info
        .get_properties()
        .iter()
        .map(|property| (property.key().to_owned(), property.val_str().to_owned()))
        .collect::<HashMap<_, _>>();

    Some(DiscoveredDevice {
        name,
        host: info.get_hostname().to_owned(),
        ipv4,
        port: info.get_port(),
        txt_records,
    })
}

/// Live browse over the local network.
///
/// Keeps the set of currently advertised devices in first-seen order and
/// yields add/remove events as the advertisement set changes.
pub struct Discovery {
    daemon: ServiceDaemon,
    receiver: mdns_sd::Receiver<ServiceEvent>,
    devices: Vec<DiscoveredDevice>,
}
impl Discovery {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|error| DiscoveryError::Resolver(error.to_string()))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|error| DiscoveryError::Resolver(error.to_string()))?;

        let devices = Vec::<DiscoveredDevice>::new();

        Ok(Self {
            daemon,
            receiver,
            devices,
        })
    }

    /// Snapshot of the live set, ordered by first appearance.
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Waits for the next change of the live set.
    pub async fn next_event(&mut self) -> Result<DiscoveryEvent, DiscoveryError> {
        loop {
            let event = self
                .receiver
                .recv_async()
                .await
                .map_err(|error| DiscoveryError::Resolver(error.to_string()))?;

            match event {
                ServiceEvent::ServiceResolved(info) => {
                    let record = match record_from_info(&info) {
                        Some(record) => record,
                        None => continue,
                    };
                    if !instance_name_matches(&record.name) {
                        log::debug!("ignoring non-device advertisement: {}", record.name);
                        continue;
                    }

                    match self
                        .devices
                        .iter_mut()
                        .find(|existing| existing.name == record.name)
                    {
                        Some(existing) => {
                            // re-resolution, refresh addresses in place
                            *existing = record;
                        }
                        None => {
                            self.devices.push(record.clone());
                            break Ok(DiscoveryEvent::Added(record));
                        }
                    }
                }
                ServiceEvent::ServiceRemoved(_, fullname) => {
                    let name = match instance_name(&fullname) {
                        Some(name) => name.to_owned(),
                        None => continue,
                    };
                    let index = self
                        .devices
                        .iter()
                        .position(|existing| existing.name == name);
                    if let Some(index) = index {
                        self.devices.remove(index);
                        break Ok(DiscoveryEvent::Removed(name));
                    }
                }
                _ => {}
            }
        }
    }

    /// Yields the first discovered device or fails after `timeout`.
    pub async fn one(
        mut self,
        timeout: Duration,
    ) -> Result<DiscoveredDevice, DiscoveryError> {
        if let Some(device) = self.devices.first() {
            return Ok(device.clone());
        }

        let device = tokio::time::timeout(timeout, async {
            loop {
                match self.next_event().await? {
                    DiscoveryEvent::Added(device) => break Ok(device),
                    DiscoveryEvent::Removed(_) => continue,
                }
            }
        })
        .await
        .map_err(|_| DiscoveryError::NotFound { timeout })??;

        Ok(device)
    }
}
impl Drop for Discovery {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}

/// One-shot discovery of the nearest device.
pub async fn discover_one(timeout: Duration) -> Result<DiscoveredDevice, DiscoveryError> {
    Discovery::new()?.one(timeout).await
}

#[cfg(test)]
mod tests_instance_name {
    use super::{instance_name, instance_name_matches};

    #[test]
    fn device_names_match() {
        assert!(instance_name_matches("PI monitor:OnePlus 8:1ab2c3d4e5f6a7b8"));
        assert!(instance_name_matches("Neon Companion:Pixel 7:8b7a6f5e"));
    }

    #[test]
    fn foreign_services_rejected() {
        assert!(!instance_name_matches("Philips Hue - 12AB34"));
        assert!(!instance_name_matches("printer:kitchen"));
        assert!(!instance_name_matches(""));
    }

    #[test]
    fn strips_service_suffix() {
        assert_eq!(
            instance_name("PI monitor:OnePlus 8:1ab2._http._tcp.local."),
            Some("PI monitor:OnePlus 8:1ab2")
        );
        assert_eq!(instance_name("foo._ipp._tcp.local."), None);
    }
}

#[cfg(test)]
mod tests_discovered_device {
    use super::DiscoveredDevice;
    use std::collections::HashMap;

    #[test]
    fn name_parts() {
        let device = DiscoveredDevice {
            name: "PI monitor:OnePlus 8:1ab2c3d4e5f6a7b8".to_owned(),
            host: "oneplus8.local.".to_owned(),
            ipv4: None,
            port: 8080,
            txt_records: HashMap::new(),
        };

        assert_eq!(device.phone_name(), Some("OnePlus 8"));
        assert_eq!(device.phone_id(), Some("1ab2c3d4e5f6a7b8"));
        assert_eq!(device.address(), "oneplus8.local");
    }
}

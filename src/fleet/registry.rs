use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use super::{Capability, DeviceClass, DeviceId, TopicPair};
use crate::error::{Error, Result};

/// One managed device as declared in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub class: DeviceClass,
    /// Capabilities to manage. Empty means everything the class supports.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Digital output channels, actuators only ("pump", "light").
    #[serde(default)]
    pub channels: Vec<String>,
}

impl DeviceSpec {
    pub fn new(id: impl Into<DeviceId>, class: DeviceClass) -> Self {
        Self {
            id: id.into(),
            class,
            capabilities: Vec::new(),
            channels: Vec::new(),
        }
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub class: DeviceClass,
    pub capabilities: Vec<Capability>,
    pub channels: Vec<String>,
}

impl Device {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Static mapping from device id to topics and class. Built once, read-only after.
#[derive(Debug, Clone)]
pub struct Registry {
    devices: Vec<Device>,
    index: HashMap<DeviceId, usize>,
}

impl Registry {
    pub fn new(specs: Vec<DeviceSpec>) -> Result<Self> {
        let mut devices = Vec::with_capacity(specs.len());
        let mut index = HashMap::new();

        for spec in specs {
            if spec.id.is_empty() || spec.id.contains(['/', '+', '#']) {
                return Err(Error::Registry(format!(
                    "device id {:?} is not a valid topic segment",
                    spec.id
                )));
            }
            if index.contains_key(&spec.id) {
                return Err(Error::Registry(format!("duplicate device id {}", spec.id)));
            }

            let capabilities = if spec.capabilities.is_empty() {
                spec.class.capabilities().to_vec()
            } else {
                let mut seen = HashSet::new();
                spec.capabilities
                    .into_iter()
                    .filter(|c| seen.insert(*c))
                    .collect()
            };
            if let Some(bad) = capabilities.iter().find(|c| !spec.class.supports(**c)) {
                return Err(Error::Registry(format!(
                    "{} is a {:?} and has no {} capability",
                    spec.id, spec.class, bad
                )));
            }

            if capabilities.contains(&Capability::Digital) && spec.channels.is_empty() {
                return Err(Error::Registry(format!(
                    "actuator {} declares no channels",
                    spec.id
                )));
            }
            if spec.class != DeviceClass::Actuator && !spec.channels.is_empty() {
                return Err(Error::Registry(format!(
                    "{} is not an actuator but declares channels",
                    spec.id
                )));
            }

            index.insert(spec.id.clone(), devices.len());
            devices.push(Device {
                id: spec.id,
                class: spec.class,
                capabilities,
                channels: spec.channels,
            });
        }

        Ok(Self { devices, index })
    }

    /// Devices in registration order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn get(&self, id: &str) -> Result<&Device> {
        self.index
            .get(id)
            .map(|&i| &self.devices[i])
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    /// Devices of one class, in registration order.
    pub fn all(&self, class: DeviceClass) -> impl Iterator<Item = &Device> + '_ {
        self.devices.iter().filter(move |d| d.class == class)
    }

    /// Devices that answer to `capability`, in registration order.
    pub fn with_capability(&self, capability: Capability) -> impl Iterator<Item = &Device> + '_ {
        self.devices.iter().filter(move |d| d.supports(capability))
    }

    pub fn topics_for(&self, id: &str, capability: Capability) -> Result<TopicPair> {
        let device = self.get(id)?;
        if !device.supports(capability) || !capability.is_queryable() {
            return Err(Error::UnsupportedCapability {
                device: id.to_string(),
                capability,
            });
        }
        Ok(TopicPair {
            request: format!("{}/{}/request", device.id, capability.segment()),
            response: format!("{}/{}/response", device.id, capability.segment()),
        })
    }

    /// Request topic for one digital output channel of an actuator.
    pub fn command_topic(&self, id: &str, channel: &str) -> Result<String> {
        let device = self.get(id)?;
        if !device.supports(Capability::Digital) || !device.channels.iter().any(|c| c == channel) {
            return Err(Error::UnsupportedCapability {
                device: id.to_string(),
                capability: Capability::Digital,
            });
        }
        Ok(format!("{}/{}/digital/request", device.id, channel))
    }

    /// Response topic -> (device, capability), for inbound routing and subscriptions.
    pub fn response_routes(&self) -> HashMap<String, (DeviceId, Capability)> {
        let mut routes = HashMap::new();
        for device in &self.devices {
            for &capability in device.capabilities.iter().filter(|c| c.is_queryable()) {
                routes.insert(
                    format!("{}/{}/response", device.id, capability.segment()),
                    (device.id.clone(), capability),
                );
            }
        }
        routes
    }

    /// Whether `topic` is a request topic this registry would publish to.
    pub fn is_request_topic(&self, topic: &str) -> bool {
        self.devices.iter().any(|d| {
            d.capabilities
                .iter()
                .filter(|c| c.is_queryable())
                .any(|c| topic == format!("{}/{}/request", d.id, c.segment()))
                || d.channels
                    .iter()
                    .any(|ch| topic == format!("{}/{}/digital/request", d.id, ch))
        })
    }
}

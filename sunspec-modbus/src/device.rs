//! SunSpec device session: discovery and polling.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decoder::Value;
use crate::dictionary::ModelDictionary;
use crate::error::{Error, Result};
use crate::model::{LoadStats, ModelInstance, ModelSnapshot};
use crate::port::{MAX_READ_COUNT, RegisterPort, read_chunked};

/// The `SunS` identifier as two big-endian registers.
pub const SUNS_MARKER: [u16; 2] = [0x5375, 0x6e53];

/// Model ID marking the end of the model list.
pub const END_MODEL_ID: u16 = 0xFFFF;

/// Base addresses searched for the `SunS` identifier, in order.
pub const DEFAULT_BASE_ADDRESSES: [u16; 3] = [40000, 0, 50000];

/// Model ID of the common model.
pub const COMMON_MODEL_ID: u16 = 1;

/// Discovery and read settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Candidate addresses of the `SunS` identifier.
    pub base_addresses: Vec<u16>,
    /// Largest number of registers per read request.
    pub max_read_count: u16,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            base_addresses: DEFAULT_BASE_ADDRESSES.to_vec(),
            max_read_count: MAX_READ_COUNT,
        }
    }
}

/// Identification read from the common model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub options: Option<String>,
    pub version: Option<String>,
    pub serial_number: Option<String>,
    pub device_address: Option<u64>,
}

impl DeviceInfo {
    fn from_common(model: &ModelInstance) -> Self {
        let text = |name: &str| {
            model
                .point(name)
                .and_then(|p| p.value())
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let device_address = match model.point("DA").and_then(|p| p.value()) {
            Some(Value::Uint(v)) => Some(*v),
            _ => None,
        };

        Self {
            manufacturer: text("Mn"),
            model: text("Md"),
            options: text("Opt"),
            version: text("Vr"),
            serial_number: text("SN"),
            device_address,
        }
    }
}

/// Outcome of a polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub models_read: usize,
    /// Models whose read was refused by the device.
    pub models_failed: usize,
    pub points: LoadStats,
}

/// A connected SunSpec device.
///
/// The session owns its register port; every operation takes `&mut self`,
/// so requests to one device are always sequential.
pub struct DeviceSession<P> {
    port: P,
    dictionary: Arc<ModelDictionary>,
    options: ScanOptions,
    base_address: Option<u16>,
    models: Vec<ModelInstance>,
    info: Option<DeviceInfo>,
}

impl<P: RegisterPort> DeviceSession<P> {
    pub fn new(port: P, dictionary: Arc<ModelDictionary>, options: ScanOptions) -> Self {
        Self {
            port,
            dictionary,
            options,
            base_address: None,
            models: Vec::new(),
            info: None,
        }
    }

    /// Session using the built-in dictionary and default options.
    pub fn with_defaults(port: P) -> Self {
        Self::new(port, ModelDictionary::builtin(), ScanOptions::default())
    }

    /// Address of the `SunS` identifier, once scanned.
    pub fn base_address(&self) -> Option<u16> {
        self.base_address
    }

    /// Discovered models in register order.
    pub fn models(&self) -> &[ModelInstance] {
        &self.models
    }

    /// Model by name and occurrence index.
    pub fn model(&self, name: &str, index: usize) -> Option<&ModelInstance> {
        self.models
            .iter()
            .find(|m| m.name() == name && m.index() == index)
    }

    /// Instances of a model ID in register order.
    pub fn models_by_id(&self, id: u16) -> impl Iterator<Item = &ModelInstance> {
        self.models.iter().filter(move |m| m.id() == id)
    }

    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn is_scanned(&self) -> bool {
        self.base_address.is_some()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Discover the device's models.
    ///
    /// Re-scanning replaces the model list.
    pub async fn scan(&mut self) -> Result<()> {
        let base = self.find_base().await?;
        let mut cursor = base as u32 + SUNS_MARKER.len() as u32;
        let mut models = Vec::new();
        let mut occurrences: HashMap<u16, usize> = HashMap::new();

        loop {
            if cursor + 1 > u16::MAX as u32 {
                return Err(Error::Unterminated { address: cursor });
            }
            let address = cursor as u16;

            let header = match self.port.read(address, 2).await {
                Ok(header) => header,
                Err(e) if e.is_exception() => {
                    debug!(address, error = %e, "Model header read refused");
                    return Err(Error::Unterminated { address: cursor });
                }
                Err(e) => return Err(e.into()),
            };
            let (id, length) = match header.as_slice() {
                [id, length] => (*id, *length),
                _ => return Err(Error::Unterminated { address: cursor }),
            };

            if id == END_MODEL_ID {
                break;
            }

            let index = occurrences.entry(id).or_insert(0);
            let model = self.bind_model(id, *index, address, length).await?;
            *index += 1;

            debug!(
                model = id,
                name = model.name(),
                address,
                length,
                "Found model"
            );
            models.push(model);
            cursor += 2 + length as u32;
        }

        info!(
            base,
            models = ?models.iter().map(ModelInstance::id).collect::<Vec<_>>(),
            "SunSpec scan complete"
        );

        self.base_address = Some(base);
        self.models = models;
        self.info = None;
        self.read_info().await?;
        Ok(())
    }

    async fn find_base(&mut self) -> Result<u16> {
        let mut responded = false;
        let mut last_error = None;

        for &base in &self.options.base_addresses {
            match self.port.read(base, 2).await {
                Ok(words) if words == SUNS_MARKER => {
                    debug!(base, "Found SunS identifier");
                    return Ok(base);
                }
                Ok(words) => {
                    responded = true;
                    debug!(base, ?words, "No SunS identifier");
                }
                Err(e) if e.is_exception() => {
                    responded = true;
                    debug!(base, error = %e, "No SunS identifier");
                }
                Err(e) => {
                    debug!(base, error = %e, "Identifier read failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !responded => Err(e.into()),
            _ => Err(Error::NotSunSpecDevice {
                tried: self.options.base_addresses.clone(),
            }),
        }
    }

    async fn bind_model(
        &mut self,
        id: u16,
        index: usize,
        header_address: u16,
        length: u16,
    ) -> Result<ModelInstance> {
        let def = match self.dictionary.require(id) {
            Ok(def) => def,
            Err(e) => {
                info!(model = id, length, error = %e, "Recording unrecognized model");
                return Ok(ModelInstance::unrecognized(id, index, header_address, length));
            }
        };

        if !def.group.has_variable_groups() || length == 0 {
            return Ok(ModelInstance::bind(&def, index, header_address, length, None));
        }

        let body_address = header_address.wrapping_add(2);
        let body = match read_chunked(
            &mut self.port,
            body_address,
            length,
            self.options.max_read_count,
        )
        .await
        {
            Ok(body) => Some(body),
            Err(e) if e.is_exception() => {
                warn!(model = id, error = %e, "Could not read model body for binding");
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ModelInstance::bind(
            &def,
            index,
            header_address,
            length,
            body.as_deref(),
        ))
    }

    async fn read_info(&mut self) -> Result<()> {
        let max_count = self.options.max_read_count;
        let Some(common) = self
            .models
            .iter_mut()
            .find(|m| m.id() == COMMON_MODEL_ID && m.is_recognized())
        else {
            warn!("Device has no common model");
            return Ok(());
        };

        match common.read(&mut self.port, max_count).await {
            Ok(_) => {
                let info = DeviceInfo::from_common(common);
                info!(
                    manufacturer = info.manufacturer.as_deref().unwrap_or("-"),
                    model = info.model.as_deref().unwrap_or("-"),
                    serial_number = info.serial_number.as_deref().unwrap_or("-"),
                    "Identified device"
                );
                self.info = Some(info);
                Ok(())
            }
            Err(Error::Transport(e)) if e.is_exception() => {
                warn!(error = %e, "Could not read common model");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read and decode every discovered model.
    ///
    /// A model the device refuses to return is logged and emptied; the
    /// others are still read. A link failure aborts the cycle.
    pub async fn read_all(&mut self) -> Result<CycleStats> {
        if !self.is_scanned() {
            return Err(Error::NotScanned);
        }

        let max_count = self.options.max_read_count;
        let mut stats = CycleStats::default();

        for model in &mut self.models {
            if !model.is_recognized() || model.length() == 0 {
                continue;
            }
            match model.read(&mut self.port, max_count).await {
                Ok(points) => {
                    stats.models_read += 1;
                    stats.points += points;
                }
                Err(Error::Transport(e)) if e.is_exception() => {
                    warn!(model = %model.key(), error = %e, "Model read refused");
                    model.invalidate();
                    stats.models_failed += 1;
                }
                Err(e) => {
                    model.invalidate();
                    return Err(e);
                }
            }
        }

        debug!(
            models_read = stats.models_read,
            models_failed = stats.models_failed,
            points = stats.points.implemented,
            failed_points = stats.points.failed,
            "Read cycle complete"
        );
        Ok(stats)
    }

    /// Write a point of the model keyed `{name}_{index}`.
    pub async fn write_point(&mut self, model_key: &str, path: &str, value: Value) -> Result<()> {
        let model = self
            .models
            .iter_mut()
            .find(|m| m.key() == model_key)
            .ok_or_else(|| Error::UnknownModelInstance(model_key.to_string()))?;
        model.write_point(&mut self.port, path, value).await
    }

    /// Decoded values of every recognized model.
    pub fn snapshot(&self) -> Vec<ModelSnapshot> {
        self.models
            .iter()
            .filter(|m| m.is_recognized())
            .map(ModelInstance::snapshot)
            .collect()
    }

    /// The data tree published to consumers: `{model}_{index}` to model values.
    pub fn data_tree(&self) -> serde_json::Value {
        let tree: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .map(|s| (s.key(), s.to_json()))
            .collect();
        serde_json::Value::Object(tree)
    }

    /// End the session and hand back the port.
    pub fn close(self) -> P {
        debug!(models = self.models.len(), "Closing SunSpec session");
        self.port
    }
}

//! SunSpec model dictionary.
//!
//! Model definitions use the SunSpec JSON layout: each model is a top-level
//! group holding an ordered list of points and, optionally, nested repeating
//! groups. The model header (`ID`, `L`) is not part of the definition; a
//! definition describes the `L` registers that follow the header.
//!
//! A set of public models is compiled into the binary and exposed through
//! [`ModelDictionary::builtin`]. Additional definitions can be loaded from
//! JSON files.
//!
//! # Example
//!
//! ```ignore
//! let mut dictionary = ModelDictionary::with_builtin();
//! dictionary.load_file("model_64001.json")?;
//!
//! let common = dictionary.get(1).unwrap();
//! assert_eq!(common.name(), "common");
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Data type of a SunSpec point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointType {
    Int16,
    Uint16,
    Count,
    Acc16,
    Enum16,
    Bitfield16,
    Pad,
    Int32,
    Uint32,
    Acc32,
    Enum32,
    Bitfield32,
    Ipaddr,
    Int64,
    Uint64,
    Acc64,
    Float32,
    Float64,
    Sunssf,
    String,
}

impl PointType {
    /// Name used in model definitions.
    pub fn as_str(&self) -> &'static str {
        match self {
            PointType::Int16 => "int16",
            PointType::Uint16 => "uint16",
            PointType::Count => "count",
            PointType::Acc16 => "acc16",
            PointType::Enum16 => "enum16",
            PointType::Bitfield16 => "bitfield16",
            PointType::Pad => "pad",
            PointType::Int32 => "int32",
            PointType::Uint32 => "uint32",
            PointType::Acc32 => "acc32",
            PointType::Enum32 => "enum32",
            PointType::Bitfield32 => "bitfield32",
            PointType::Ipaddr => "ipaddr",
            PointType::Int64 => "int64",
            PointType::Uint64 => "uint64",
            PointType::Acc64 => "acc64",
            PointType::Float32 => "float32",
            PointType::Float64 => "float64",
            PointType::Sunssf => "sunssf",
            PointType::String => "string",
        }
    }

    /// Register count of the type, `None` for variable-length strings.
    pub fn fixed_size(&self) -> Option<u16> {
        match self {
            PointType::Int16
            | PointType::Uint16
            | PointType::Count
            | PointType::Acc16
            | PointType::Enum16
            | PointType::Bitfield16
            | PointType::Pad
            | PointType::Sunssf => Some(1),
            PointType::Int32
            | PointType::Uint32
            | PointType::Acc32
            | PointType::Enum32
            | PointType::Bitfield32
            | PointType::Ipaddr
            | PointType::Float32 => Some(2),
            PointType::Int64 | PointType::Uint64 | PointType::Acc64 | PointType::Float64 => {
                Some(4)
            }
            PointType::String => None,
        }
    }

    /// Whether a point of this type can be used as a repeat count.
    pub fn is_count_like(&self) -> bool {
        matches!(
            self,
            PointType::Count | PointType::Uint16 | PointType::Uint32
        )
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access mode of a point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    #[default]
    #[serde(rename = "R")]
    ReadOnly,
    #[serde(rename = "RW")]
    ReadWrite,
}

/// Whether a device must implement a point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    #[serde(rename = "M")]
    Mandatory,
    #[default]
    #[serde(rename = "O")]
    Optional,
}

/// Scale factor of a point: the name of a `sunssf` point, or a constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleFactor {
    Fixed(i16),
    Point(String),
}

/// Repeat count of a group: a constant, or the name of a count point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupCount {
    Fixed(u16),
    Point(String),
}

/// Definition of a single point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDef {
    pub name: String,
    #[serde(rename = "type")]
    pub point_type: PointType,
    /// Size in registers.
    pub size: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sf: Option<ScaleFactor>,
    #[serde(default)]
    pub access: Access,
    #[serde(default)]
    pub mandatory: Presence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
}

impl PointDef {
    /// Create a read-only point definition.
    pub fn new(name: impl Into<String>, point_type: PointType, size: u16) -> Self {
        Self {
            name: name.into(),
            point_type,
            size,
            sf: None,
            access: Access::ReadOnly,
            mandatory: Presence::Optional,
            units: None,
            label: None,
            desc: None,
        }
    }

    /// Set the scale factor point.
    pub fn with_sf(mut self, sf: impl Into<String>) -> Self {
        self.sf = Some(ScaleFactor::Point(sf.into()));
        self
    }

    /// Mark the point writable.
    pub fn writable(mut self) -> Self {
        self.access = Access::ReadWrite;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    /// Name of the scale factor point, if the scale factor is not a constant.
    pub fn sf_point(&self) -> Option<&str> {
        match &self.sf {
            Some(ScaleFactor::Point(name)) => Some(name),
            _ => None,
        }
    }
}

/// Definition of a group of points (a model, or a repeating block inside one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Repeat count. `None` on a nested group means "fill the rest of the model".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<GroupCount>,
    #[serde(default)]
    pub points: Vec<PointDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupDef>,
}

impl GroupDef {
    pub fn new(name: impl Into<String>, points: Vec<PointDef>) -> Self {
        Self {
            name: name.into(),
            label: None,
            desc: None,
            count: None,
            points,
            groups: Vec::new(),
        }
    }

    /// Add a nested repeating group.
    pub fn with_group(mut self, group: GroupDef) -> Self {
        self.groups.push(group);
        self
    }

    /// Set the repeat count.
    pub fn with_count(mut self, count: GroupCount) -> Self {
        self.count = Some(count);
        self
    }

    /// Look up a point by name.
    pub fn point(&self, name: &str) -> Option<&PointDef> {
        self.points.iter().find(|p| p.name == name)
    }

    /// Registers taken by the group's own points.
    pub fn fixed_len(&self) -> u32 {
        self.points.iter().map(|p| p.size as u32).sum()
    }

    /// Total length of one instance, if it does not depend on device data.
    pub fn static_len(&self) -> Option<u32> {
        let mut len = self.fixed_len();
        for group in &self.groups {
            match group.count {
                Some(GroupCount::Fixed(n)) => len += n as u32 * group.static_len()?,
                _ => return None,
            }
        }
        Some(len)
    }

    /// Whether any nested group has a device-dependent repeat count.
    pub fn has_variable_groups(&self) -> bool {
        self.groups.iter().any(|g| {
            !matches!(g.count, Some(GroupCount::Fixed(_))) || g.has_variable_groups()
        })
    }
}

/// Definition of a SunSpec model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    pub id: u16,
    pub group: GroupDef,
}

impl ModelDef {
    pub fn new(id: u16, group: GroupDef) -> Self {
        Self { id, group }
    }

    /// Model name, used to key instances as `{name}_{index}`.
    pub fn name(&self) -> &str {
        &self.group.name
    }

    /// Check the structural consistency of the definition.
    pub fn validate(&self) -> Result<()> {
        if self.id == 0xFFFF {
            return Err(Error::dictionary("model ID 0xFFFF is reserved"));
        }
        if self.group.count.is_some() {
            return Err(Error::dictionary(format!(
                "model {}: top-level group cannot repeat",
                self.id
            )));
        }
        let mut scope = Vec::new();
        validate_group(self.id, &self.group, &mut scope)
    }

    /// Points whose scale factor point is placed after them in the same group.
    ///
    /// These resolve correctly (scale factors are applied after the whole
    /// model is decoded), but are worth knowing about when adding models.
    pub fn forward_scale_refs(&self) -> Vec<(String, String)> {
        let mut refs = Vec::new();
        collect_forward_refs(&self.group, &mut refs);
        refs
    }
}

fn validate_group<'a>(id: u16, group: &'a GroupDef, scope: &mut Vec<&'a PointDef>) -> Result<()> {
    let mut names = HashSet::new();
    for point in &group.points {
        if !names.insert(point.name.as_str()) {
            return Err(Error::dictionary(format!(
                "model {}: duplicate point '{}' in group '{}'",
                id, point.name, group.name
            )));
        }
        match point.point_type.fixed_size() {
            Some(size) if size != point.size => {
                return Err(Error::dictionary(format!(
                    "model {}: point '{}' of type {} must have size {}, not {}",
                    id, point.name, point.point_type, size, point.size
                )));
            }
            None if point.size == 0 => {
                return Err(Error::dictionary(format!(
                    "model {}: string point '{}' has size 0",
                    id, point.name
                )));
            }
            _ => {}
        }
    }

    let mark = scope.len();
    scope.extend(group.points.iter());

    for point in &group.points {
        if let Some(sf) = point.sf_point() {
            match scope.iter().rev().find(|p| p.name == sf) {
                Some(p) if p.point_type == PointType::Sunssf => {}
                Some(_) => {
                    return Err(Error::dictionary(format!(
                        "model {}: scale factor '{}' of point '{}' is not a sunssf point",
                        id, sf, point.name
                    )));
                }
                None => {
                    return Err(Error::dictionary(format!(
                        "model {}: point '{}' references unknown scale factor '{}'",
                        id, point.name, sf
                    )));
                }
            }
        }
    }

    let mut group_names = HashSet::new();
    for nested in &group.groups {
        if !group_names.insert(nested.name.as_str()) {
            return Err(Error::dictionary(format!(
                "model {}: duplicate group '{}' in group '{}'",
                id, nested.name, group.name
            )));
        }
        if let Some(GroupCount::Point(count)) = &nested.count {
            match group.point(count) {
                Some(p) if p.point_type.is_count_like() => {}
                _ => {
                    return Err(Error::dictionary(format!(
                        "model {}: group '{}' count '{}' is not a count point of '{}'",
                        id, nested.name, count, group.name
                    )));
                }
            }
        }
        if nested.count.is_none() && nested.static_len().unwrap_or(0) == 0 {
            return Err(Error::dictionary(format!(
                "model {}: group '{}' has no count and no fixed length",
                id, nested.name
            )));
        }
        validate_group(id, nested, scope)?;
    }

    scope.truncate(mark);
    Ok(())
}

fn collect_forward_refs(group: &GroupDef, refs: &mut Vec<(String, String)>) {
    for (i, point) in group.points.iter().enumerate() {
        if let Some(sf) = point.sf_point() {
            if group.points[i + 1..].iter().any(|p| p.name == sf) {
                refs.push((point.name.clone(), sf.to_string()));
            }
        }
    }
    for nested in &group.groups {
        collect_forward_refs(nested, refs);
    }
}

/// Contents of a definition file: a single model or a list of models.
#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionFile {
    One(ModelDef),
    Many(Vec<ModelDef>),
}

/// Catalog of model definitions keyed by model ID.
#[derive(Debug, Clone, Default)]
pub struct ModelDictionary {
    models: HashMap<u16, Arc<ModelDef>>,
}

static BUILTIN_SOURCES: &[(&str, &str)] = &[
    ("model_1.json", include_str!("../models/model_1.json")),
    ("model_101.json", include_str!("../models/model_101.json")),
    ("model_102.json", include_str!("../models/model_102.json")),
    ("model_103.json", include_str!("../models/model_103.json")),
    ("model_111.json", include_str!("../models/model_111.json")),
    ("model_112.json", include_str!("../models/model_112.json")),
    ("model_113.json", include_str!("../models/model_113.json")),
    ("model_120.json", include_str!("../models/model_120.json")),
    ("model_121.json", include_str!("../models/model_121.json")),
    ("model_122.json", include_str!("../models/model_122.json")),
    ("model_123.json", include_str!("../models/model_123.json")),
    ("model_160.json", include_str!("../models/model_160.json")),
    ("model_201.json", include_str!("../models/model_201.json")),
    ("model_202.json", include_str!("../models/model_202.json")),
    ("model_203.json", include_str!("../models/model_203.json")),
    ("model_204.json", include_str!("../models/model_204.json")),
];

static BUILTIN: Lazy<Arc<ModelDictionary>> = Lazy::new(|| {
    let mut dictionary = ModelDictionary::new();
    for (file, source) in BUILTIN_SOURCES {
        if let Err(e) = dictionary.load_json(source) {
            tracing::error!(file, error = %e, "Skipping invalid built-in model definition");
        }
    }
    Arc::new(dictionary)
});

impl ModelDictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide dictionary of built-in models.
    pub fn builtin() -> Arc<ModelDictionary> {
        BUILTIN.clone()
    }

    /// A mutable copy of the built-in dictionary, to extend with custom models.
    pub fn with_builtin() -> Self {
        BUILTIN.as_ref().clone()
    }

    /// Add a definition, replacing any previous one with the same ID.
    pub fn insert(&mut self, def: ModelDef) -> Result<()> {
        def.validate()?;

        for (point, sf) in def.forward_scale_refs() {
            tracing::debug!(
                model = def.id,
                point = %point,
                sf = %sf,
                "Scale factor is placed after its dependent point"
            );
        }

        let id = def.id;
        if self.models.insert(id, Arc::new(def)).is_some() {
            tracing::debug!(model = id, "Replaced existing model definition");
        }
        Ok(())
    }

    /// Load definitions from a JSON string (one model or an array of models).
    ///
    /// Returns the IDs that were loaded.
    pub fn load_json(&mut self, json: &str) -> Result<Vec<u16>> {
        let defs = match serde_json::from_str(json)? {
            DefinitionFile::One(def) => vec![def],
            DefinitionFile::Many(defs) => defs,
        };

        let mut ids = Vec::with_capacity(defs.len());
        for def in defs {
            ids.push(def.id);
            self.insert(def)?;
        }
        Ok(ids)
    }

    /// Load definitions from a JSON file.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<Vec<u16>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ids = self.load_json(&content)?;
        tracing::info!(path = %path.display(), models = ?ids, "Loaded model definitions");
        Ok(ids)
    }

    /// Look up a model definition.
    pub fn get(&self, id: u16) -> Option<Arc<ModelDef>> {
        self.models.get(&id).cloned()
    }

    /// Look up a model definition, failing with [`Error::UnknownModel`].
    pub fn require(&self, id: u16) -> Result<Arc<ModelDef>> {
        self.get(id).ok_or(Error::UnknownModel(id))
    }

    pub fn contains(&self, id: u16) -> bool {
        self.models.contains_key(&id)
    }

    /// Known model IDs in ascending order.
    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.models.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

//! Model instances discovered on a device.
//!
//! A [`ModelInstance`] binds a [`ModelDef`] to a register address and a
//! reported length. Binding computes the offset of every point and expands
//! repeating groups. Loading decodes the model registers in two passes: raw
//! values first, then scale factors, so a scale factor may sit anywhere in
//! the model relative to the points that use it.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::decoder::{self, Value};
use crate::dictionary::{GroupCount, GroupDef, ModelDef, PointDef, PointType, ScaleFactor};
use crate::error::{DecodeError, Error, Result};
use crate::port::{RegisterPort, read_chunked};

/// Decoded state of a point.
///
/// `value` is only set when `raw` is, and `cvalue` only when `value` is.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PointValue {
    /// Registers as read from the device.
    pub raw: Option<Vec<u16>>,
    /// Decoded value, `None` when the device reports "not implemented".
    pub value: Option<Value>,
    /// Value with its scale factor applied.
    pub cvalue: Option<Value>,
}

impl PointValue {
    pub fn clear(&mut self) {
        *self = PointValue::default();
    }

    pub fn is_implemented(&self) -> bool {
        self.value.is_some()
    }
}

/// A point bound to its offset within a model.
#[derive(Debug, Clone)]
pub struct Point {
    def: PointDef,
    offset: u16,
    state: PointValue,
}

impl Point {
    fn new(def: PointDef, offset: u16) -> Self {
        Self {
            def,
            offset,
            state: PointValue::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &PointDef {
        &self.def
    }

    /// Offset from the first register after the model header.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn state(&self) -> &PointValue {
        &self.state
    }

    pub fn value(&self) -> Option<&Value> {
        self.state.value.as_ref()
    }

    pub fn cvalue(&self) -> Option<&Value> {
        self.state.cvalue.as_ref()
    }
}

/// One instance of a group: the model's top-level block or one repetition
/// of a nested group.
#[derive(Debug, Clone)]
pub struct GroupInstance {
    name: String,
    index: usize,
    offset: u16,
    len: u16,
    points: Vec<Point>,
    groups: Vec<(String, Vec<GroupInstance>)>,
}

impl GroupInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position among the repetitions of this group.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Registers covered by this instance, nested groups included.
    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Points in register order.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point(&self, name: &str) -> Option<&Point> {
        self.points.iter().find(|p| p.def.name == name)
    }

    /// Instances of a nested group, in register order.
    pub fn group(&self, name: &str) -> &[GroupInstance] {
        self.groups
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, instances)| instances.as_slice())
            .unwrap_or(&[])
    }

    /// Nested groups in definition order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &[GroupInstance])> {
        self.groups
            .iter()
            .map(|(name, instances)| (name.as_str(), instances.as_slice()))
    }

    fn group_mut(&mut self, name: &str) -> Option<&mut Vec<GroupInstance>> {
        self.groups
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, instances)| instances)
    }

    fn for_each_point_mut(&mut self, f: &mut impl FnMut(&mut Point)) {
        for point in &mut self.points {
            f(point);
        }
        for (_, instances) in &mut self.groups {
            for group in instances {
                group.for_each_point_mut(f);
            }
        }
    }

    fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            index: self.index,
            points: snapshot_points(&self.points),
            groups: snapshot_groups(&self.groups),
        }
    }
}

/// Layout state while binding a model.
struct Binder<'a> {
    model_id: u16,
    /// Registers available after the header (the reported `L`).
    span: u32,
    /// Model body, when it was read for binding.
    body: Option<&'a [u16]>,
    truncated: usize,
}

impl Binder<'_> {
    fn bind_group(&mut self, def: &GroupDef, index: usize, offset: u32) -> GroupInstance {
        let mut cursor = offset;
        let mut points = Vec::with_capacity(def.points.len());

        for (i, point) in def.points.iter().enumerate() {
            if cursor + point.size as u32 > self.span {
                // Later points would land on the wrong registers.
                self.truncated += def.points.len() - i;
                self.truncated += def.groups.iter().map(declared_points).sum::<usize>();
                return GroupInstance {
                    name: def.name.clone(),
                    index,
                    offset: offset as u16,
                    len: (cursor - offset) as u16,
                    points,
                    groups: def.groups.iter().map(|g| (g.name.clone(), Vec::new())).collect(),
                };
            }
            points.push(Point::new(point.clone(), cursor as u16));
            cursor += point.size as u32;
        }

        let mut groups = Vec::with_capacity(def.groups.len());
        for nested in &def.groups {
            let count = self.group_count(nested, &points, cursor);
            let mut instances = Vec::with_capacity(count);
            for i in 0..count {
                if cursor >= self.span {
                    break;
                }
                let instance = self.bind_group(nested, i, cursor);
                if instance.len == 0 {
                    break;
                }
                cursor += instance.len as u32;
                instances.push(instance);
            }
            if instances.len() < count {
                warn!(
                    model = self.model_id,
                    group = %nested.name,
                    expected = count,
                    bound = instances.len(),
                    "Repeating group does not fit in the model length"
                );
            }
            groups.push((nested.name.clone(), instances));
        }

        GroupInstance {
            name: def.name.clone(),
            index,
            offset: offset as u16,
            len: (cursor - offset) as u16,
            points,
            groups,
        }
    }

    /// Number of repetitions of a nested group.
    fn group_count(&self, def: &GroupDef, siblings: &[Point], cursor: u32) -> usize {
        if let Some(GroupCount::Fixed(n)) = def.count {
            return n as usize;
        }

        if let Some(GroupCount::Point(name)) = &def.count {
            let counted = siblings
                .iter()
                .find(|p| p.def.name == *name)
                .and_then(|p| self.read_count(p));
            if let Some(n) = counted {
                return n;
            }
            debug!(
                model = self.model_id,
                group = %def.name,
                count = %name,
                "Count point unavailable, deriving repetitions from model length"
            );
        }

        let remaining = self.span.saturating_sub(cursor);
        match def.static_len() {
            Some(len) if len > 0 => {
                if remaining % len != 0 {
                    warn!(
                        model = self.model_id,
                        group = %def.name,
                        remaining,
                        group_len = len,
                        "Model length is not a whole number of group repetitions"
                    );
                }
                (remaining / len) as usize
            }
            _ => 0,
        }
    }

    fn read_count(&self, point: &Point) -> Option<usize> {
        let body = self.body?;
        let start = point.offset as usize;
        let words = body.get(start..start + point.def.size as usize)?;
        match decoder::decode(point.def.point_type, words) {
            Ok(Some(value)) => value.as_i128().and_then(|n| usize::try_from(n).ok()),
            _ => None,
        }
    }
}

/// Points declared by one repetition of a group, nested groups included.
fn declared_points(def: &GroupDef) -> usize {
    def.points.len() + def.groups.iter().map(declared_points).sum::<usize>()
}

/// A model discovered on a device.
#[derive(Debug, Clone)]
pub struct ModelInstance {
    id: u16,
    name: String,
    index: usize,
    header_address: u16,
    length: u16,
    recognized: bool,
    root: GroupInstance,
}

/// Outcome of decoding a model's registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Points that hold a value.
    pub implemented: usize,
    /// Points that report "not implemented".
    pub unimplemented: usize,
    /// Points that could not be decoded.
    pub failed: usize,
}

impl std::ops::AddAssign for LoadStats {
    fn add_assign(&mut self, other: Self) {
        self.implemented += other.implemented;
        self.unimplemented += other.unimplemented;
        self.failed += other.failed;
    }
}

impl ModelInstance {
    /// Bind a definition to a model found at `header_address` with length `length`.
    ///
    /// `body` is the model's register block, needed to resolve repeating
    /// groups whose count is held in a point. Without it the count is
    /// derived from the length.
    pub fn bind(
        def: &ModelDef,
        index: usize,
        header_address: u16,
        length: u16,
        body: Option<&[u16]>,
    ) -> Self {
        let mut binder = Binder {
            model_id: def.id,
            span: length as u32,
            body,
            truncated: 0,
        };
        let root = binder.bind_group(&def.group, 0, 0);

        if binder.truncated > 0 {
            warn!(
                model = def.id,
                length,
                dropped = binder.truncated,
                "Points beyond the reported model length were dropped"
            );
        }
        if (root.len as u32) < length as u32 {
            debug!(
                model = def.id,
                length,
                bound = root.len,
                "Model is longer than its definition"
            );
        }

        Self {
            id: def.id,
            name: def.name().to_string(),
            index,
            header_address,
            length,
            recognized: true,
            root,
        }
    }

    /// A model whose ID is not in the dictionary. It has no points.
    pub fn unrecognized(id: u16, index: usize, header_address: u16, length: u16) -> Self {
        let name = format!("model_{}", id);
        Self {
            id,
            name: name.clone(),
            index,
            header_address,
            length,
            recognized: false,
            root: GroupInstance {
                name,
                index: 0,
                offset: 0,
                len: 0,
                points: Vec::new(),
                groups: Vec::new(),
            },
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Occurrence of this model ID on the device, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Key used in data trees: `{name}_{index}`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.index)
    }

    /// Address of the model ID register.
    pub fn header_address(&self) -> u16 {
        self.header_address
    }

    /// Address of the first register after the header.
    pub fn base_address(&self) -> u16 {
        self.header_address.wrapping_add(2)
    }

    /// Length reported by the device (`L`).
    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn is_recognized(&self) -> bool {
        self.recognized
    }

    /// The model's top-level group.
    pub fn root(&self) -> &GroupInstance {
        &self.root
    }

    /// Top-level point by name.
    pub fn point(&self, name: &str) -> Option<&Point> {
        self.root.point(name)
    }

    /// Point by path: `"Point"` or `"group.index.Point"`, nesting allowed.
    pub fn find(&self, path: &str) -> Option<&Point> {
        let (groups, point) = split_path(path)?;
        let mut current = &self.root;
        for (name, index) in groups {
            current = current.group(name).get(index)?;
        }
        current.point(point)
    }

    /// Read and decode the model.
    ///
    /// Unrecognized and empty models are skipped.
    pub async fn read<P: RegisterPort>(&mut self, port: &mut P, max_count: u16) -> Result<LoadStats> {
        if !self.recognized || self.length == 0 {
            return Ok(LoadStats::default());
        }
        let words = read_chunked(port, self.base_address(), self.length, max_count).await?;
        Ok(self.load(&words))
    }

    /// Decode the model from its register block (without the header).
    pub fn load(&mut self, words: &[u16]) -> LoadStats {
        let mut stats = LoadStats::default();
        let model_id = self.id;

        self.root.for_each_point_mut(&mut |point| {
            let start = point.offset as usize;
            let end = start + point.def.size as usize;
            let result = match words.get(start..end) {
                Some(raw) => decoder::decode(point.def.point_type, raw).map(|v| (raw, v)),
                None => Err(DecodeError::OutOfSpan {
                    offset: point.offset,
                    size: point.def.size,
                    span: words.len() as u16,
                }),
            };

            match result {
                Ok((raw, value)) => {
                    if value.is_some() {
                        stats.implemented += 1;
                    } else {
                        stats.unimplemented += 1;
                    }
                    point.state = PointValue {
                        raw: Some(raw.to_vec()),
                        value,
                        cvalue: None,
                    };
                }
                Err(e) => {
                    warn!(model = model_id, point = %point.def.name, error = %e, "Failed to decode point");
                    point.state.clear();
                    stats.failed += 1;
                }
            }
        });

        let mut scope = Vec::new();
        resolve_scale(model_id, &mut self.root, &mut scope);
        stats
    }

    /// Forget all decoded values.
    pub fn invalidate(&mut self) {
        self.root.for_each_point_mut(&mut |point| point.state.clear());
    }

    /// Encode and write a point.
    ///
    /// Scaled points take the scaled value and are written as
    /// `round(value / 10^sf)`, using the scale factor from the last read.
    /// Fails with [`Error::ReadOnlyPoint`] before any request is sent when
    /// the point is not writable.
    pub async fn write_point<P: RegisterPort>(
        &mut self,
        port: &mut P,
        path: &str,
        value: Value,
    ) -> Result<()> {
        let target = self.locate(path)?;
        let point = target.point;
        if !point.def.is_writable() {
            return Err(Error::ReadOnlyPoint {
                model: self.key(),
                point: path.to_string(),
            });
        }

        let sf = match &point.def.sf {
            None => 0,
            Some(ScaleFactor::Fixed(sf)) => *sf,
            Some(ScaleFactor::Point(name)) => target.sf.ok_or_else(|| {
                Error::decode(
                    path,
                    DecodeError::TypeMismatch {
                        point_type: PointType::Sunssf,
                        value: format!("{} is not available", name),
                    },
                )
            })?,
        };

        let register = decoder::remove_scale(&value, sf);
        let words = decoder::encode(point.def.point_type, point.def.size, &register)
            .map_err(|e| Error::decode(path, e))?;
        let address = self.base_address().wrapping_add(point.offset);

        debug!(model = %self.key(), point = path, address, ?words, "Writing point");
        port.write(address, &words).await?;

        let decoded = decoder::decode(point.def.point_type, &words).map_err(|e| Error::decode(path, e))?;
        let cvalue = decoded.as_ref().map(|v| decoder::apply_scale(v, sf));
        if let Some(point) = self.find_mut(path) {
            point.state = PointValue {
                raw: Some(words),
                value: decoded,
                cvalue,
            };
        }
        Ok(())
    }

    fn locate(&self, path: &str) -> Result<Located<'_>> {
        let unknown = || Error::UnknownPoint {
            model: self.key(),
            point: path.to_string(),
        };

        let (groups, name) = split_path(path).ok_or_else(unknown)?;
        let mut current = &self.root;
        let mut chain = vec![current];
        for (group, index) in groups {
            current = current.group(group).get(index).ok_or_else(unknown)?;
            chain.push(current);
        }
        let point = current.point(name).ok_or_else(unknown)?;

        let sf = point.def.sf_point().and_then(|sf_name| {
            chain
                .iter()
                .rev()
                .find_map(|g| g.point(sf_name))
                .and_then(|p| p.value())
                .and_then(Value::as_scale_factor)
        });

        Ok(Located { point, sf })
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Point> {
        let (groups, name) = split_path(path)?;
        let mut current = &mut self.root;
        for (group, index) in groups {
            current = current.group_mut(group)?.get_mut(index)?;
        }
        current.points.iter_mut().find(|p| p.def.name == name)
    }

    /// Decoded values of the model.
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            id: self.id,
            name: self.name.clone(),
            index: self.index,
            points: snapshot_points(&self.root.points),
            groups: snapshot_groups(&self.root.groups),
        }
    }
}

struct Located<'a> {
    point: &'a Point,
    sf: Option<i16>,
}

/// Split `"a.0.b.1.P"` into `[("a", 0), ("b", 1)]` and `"P"`.
fn split_path(path: &str) -> Option<(Vec<(&str, usize)>, &str)> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.len() % 2 == 0 || segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    let (point, groups) = segments.split_last()?;
    let groups = groups
        .chunks(2)
        .map(|pair| pair[1].parse().ok().map(|index| (pair[0], index)))
        .collect::<Option<Vec<_>>>()?;
    Some((groups, point))
}

/// Apply scale factors, looking up `sunssf` points in the group first and
/// then in its ancestors.
fn resolve_scale(model_id: u16, group: &mut GroupInstance, scope: &mut Vec<(String, Option<i16>)>) {
    let mark = scope.len();
    scope.extend(
        group
            .points
            .iter()
            .filter(|p| p.def.point_type == PointType::Sunssf)
            .map(|p| (p.def.name.clone(), p.value().and_then(Value::as_scale_factor))),
    );

    for point in &mut group.points {
        let Some(value) = point.state.value.as_ref() else {
            continue;
        };
        point.state.cvalue = match &point.def.sf {
            None => Some(value.clone()),
            Some(ScaleFactor::Fixed(sf)) => Some(decoder::apply_scale(value, *sf)),
            Some(ScaleFactor::Point(name)) => {
                match scope.iter().rev().find(|(n, _)| n == name) {
                    Some((_, Some(sf))) => Some(decoder::apply_scale(value, *sf)),
                    Some((_, None)) => None,
                    None => {
                        warn!(
                            model = model_id,
                            point = %point.def.name,
                            sf = %name,
                            "Scale factor point is not present on the device"
                        );
                        None
                    }
                }
            }
        };
    }

    for (_, instances) in &mut group.groups {
        for nested in instances {
            resolve_scale(model_id, nested, scope);
        }
    }

    scope.truncate(mark);
}

/// Decoded values of a group instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSnapshot {
    pub index: usize,
    pub points: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Vec<GroupSnapshot>>,
}

/// Decoded values of a model instance.
///
/// Only points with a scaled value are included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSnapshot {
    pub id: u16,
    pub name: String,
    pub index: usize,
    pub points: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Vec<GroupSnapshot>>,
}

impl ModelSnapshot {
    /// Key used in data trees: `{name}_{index}`.
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.index)
    }

    /// Flat JSON object: points by name, group instances as `{group}_{index}`.
    pub fn to_json(&self) -> serde_json::Value {
        tree_json(&self.points, &self.groups)
    }

    /// Every value with its path below the model, e.g. `["module_0", "DCA"]`.
    pub fn leaves(&self) -> Vec<(Vec<String>, &Value)> {
        let mut out = Vec::new();
        collect_leaves(&self.points, &self.groups, &mut Vec::new(), &mut out);
        out
    }
}

fn snapshot_points(points: &[Point]) -> BTreeMap<String, Value> {
    points
        .iter()
        .filter_map(|p| p.cvalue().map(|v| (p.def.name.clone(), v.clone())))
        .collect()
}

fn snapshot_groups(groups: &[(String, Vec<GroupInstance>)]) -> BTreeMap<String, Vec<GroupSnapshot>> {
    groups
        .iter()
        .filter(|(_, instances)| !instances.is_empty())
        .map(|(name, instances)| {
            (
                name.clone(),
                instances.iter().map(GroupInstance::snapshot).collect(),
            )
        })
        .collect()
}

fn tree_json(
    points: &BTreeMap<String, Value>,
    groups: &BTreeMap<String, Vec<GroupSnapshot>>,
) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (name, value) in points {
        object.insert(name.clone(), serde_json::json!(value));
    }
    for (name, instances) in groups {
        for instance in instances {
            object.insert(
                format!("{}_{}", name, instance.index),
                tree_json(&instance.points, &instance.groups),
            );
        }
    }
    serde_json::Value::Object(object)
}

fn collect_leaves<'a>(
    points: &'a BTreeMap<String, Value>,
    groups: &'a BTreeMap<String, Vec<GroupSnapshot>>,
    prefix: &mut Vec<String>,
    out: &mut Vec<(Vec<String>, &'a Value)>,
) {
    for (name, value) in points {
        let mut path = prefix.clone();
        path.push(name.clone());
        out.push((path, value));
    }
    for (name, instances) in groups {
        for instance in instances {
            prefix.push(format!("{}_{}", name, instance.index));
            collect_leaves(&instance.points, &instance.groups, prefix, out);
            prefix.pop();
        }
    }
}

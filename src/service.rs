use chrono::{DateTime, Local};
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::sensor::{measurement_paths, Unit};

pub const PRODUCT_ID: i64 = 0xFFFF;
pub const PRODUCT_NAME: &str = "MQTT meter";

/// Receiver of derived and forwarded meter values.
pub trait ValueSink {
    fn publish(&mut self, path: &str, value: f64);
}

/// A value held by a service path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Number(f64),
    Text(String),
}

/// Static fields describing the device service.
#[derive(Debug, Clone)]
pub struct Identity {
    pub service_base: String,
    pub device_instance: u32,
    /// Human readable description of the upstream connection (the MQTT host).
    pub connection: String,
}

impl Identity {
    /// Service name, e.g. `com.victronenergy.grid.mqtt_40`.
    pub fn service_name(&self) -> String {
        format!("{}.mqtt_{:02}", self.service_base, self.device_instance)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    unit: Option<Unit>,
    updated: DateTime<Local>,
}

impl Entry {
    fn new(value: Value, unit: Option<Unit>) -> Self {
        Self {
            value,
            unit,
            updated: Local::now(),
        }
    }

    fn text(&self) -> Option<String> {
        match (&self.value, self.unit) {
            (Value::Null, _) => None,
            (Value::Number(v), Some(unit)) => Some(unit.format(*v)),
            (Value::Number(v), None) => Some(v.to_string()),
            (Value::Int(v), _) => Some(v.to_string()),
            (Value::Text(s), _) => Some(s.clone()),
        }
    }
}

/// One path as it is exported to other processes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathUpdate {
    #[serde(skip)]
    pub path: String,
    pub value: Value,
    pub text: Option<String>,
    pub timestamp: String,
}

/// The device service: a tree of paths, each with a value and an optional
/// unit used to render its text form. Paths written since the last
/// [`ServiceTree::drain_changed`] are remembered so the transport can
/// forward only what moved.
#[derive(Debug, Clone)]
pub struct ServiceTree {
    name: String,
    paths: BTreeMap<String, Entry>,
    changed: Vec<String>,
}

impl ServiceTree {
    /// Register identity and measurement paths. Identity is never recomputed;
    /// measurement paths start out null.
    pub fn new(identity: &Identity) -> Self {
        let mut tree = Self {
            name: identity.service_name(),
            paths: BTreeMap::new(),
            changed: Vec::new(),
        };

        tree.add_path(
            "/Management/ProcessName",
            Value::Text(env!("CARGO_PKG_NAME").to_string()),
        );
        tree.add_path(
            "/Management/ProcessVersion",
            Value::Text(env!("CARGO_PKG_VERSION").to_string()),
        );
        tree.add_path(
            "/Management/Connection",
            Value::Text(identity.connection.clone()),
        );
        tree.add_path(
            "/DeviceInstance",
            Value::Int(i64::from(identity.device_instance)),
        );
        tree.add_path("/ProductId", Value::Int(PRODUCT_ID));
        tree.add_path("/ProductName", Value::Text(PRODUCT_NAME.to_string()));
        tree.add_path("/FirmwareVersion", Value::Null);
        tree.add_path("/Serial", Value::Null);
        tree.add_path("/Connected", Value::Int(1));

        for output in measurement_paths() {
            tree.paths
                .insert(output.path.to_string(), Entry::new(Value::Null, Some(output.unit)));
        }

        tree
    }

    fn add_path(&mut self, path: &str, value: Value) {
        self.paths.insert(path.to_string(), Entry::new(value, None));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.paths.get(path).map(|e| &e.value)
    }

    /// Unit-formatted text of a path, `None` while the path is null or unknown.
    pub fn text(&self, path: &str) -> Option<String> {
        self.paths.get(path).and_then(Entry::text)
    }

    /// Take every path written since the previous call, in write order.
    pub fn drain_changed(&mut self) -> Vec<PathUpdate> {
        let changed = std::mem::take(&mut self.changed);
        changed
            .into_iter()
            .filter_map(|path| self.update_for(&path))
            .collect()
    }

    /// Every path of the tree, sorted by path.
    pub fn snapshot(&self) -> Vec<PathUpdate> {
        self.paths
            .keys()
            .filter_map(|path| self.update_for(path))
            .collect()
    }

    fn update_for(&self, path: &str) -> Option<PathUpdate> {
        let entry = self.paths.get(path)?;
        Some(PathUpdate {
            path: path.to_string(),
            value: entry.value.clone(),
            text: entry.text(),
            timestamp: entry.updated.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        })
    }
}

impl ValueSink for ServiceTree {
    fn publish(&mut self, path: &str, value: f64) {
        let entry = self
            .paths
            .entry(path.to_string())
            .or_insert_with(|| Entry::new(Value::Null, None));
        entry.value = Value::Number(value);
        entry.updated = Local::now();

        debug!("{}{} = {}", self.name, path, self.text(path).unwrap_or_default());

        if !self.changed.iter().any(|p| p == path) {
            self.changed.push(path.to_string());
        }
    }
}

//! Cluster objects as seen across the accessor boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Resource kinds the orchestrator reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Deployment,
    Job,
    Pod,
    Service,
    ConfigMap,
    Ingress,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Job => "Job",
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Ingress => "Ingress",
        }
    }

    /// Resource name as kubectl expects it on the command line.
    pub fn cli_name(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::Job => "job",
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::Ingress => "ingress",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "job" | "jobs" => Ok(ResourceKind::Job),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "configmap" | "configmaps" | "cm" => Ok(ResourceKind::ConfigMap),
            "ingress" | "ingresses" | "ing" => Ok(ResourceKind::Ingress),
            other => Err(Error::logical(format!("unsupported resource kind '{other}'"))),
        }
    }
}

/// A (kind, name) pair identifying one cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.cli_name(), self.name)
    }
}

/// One cluster object: its kind plus the raw JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    kind: ResourceKind,
    body: Value,
}

impl Resource {
    pub fn new(kind: ResourceKind, body: Value) -> Self {
        Self { kind, body }
    }

    /// Build from a document carrying its own `kind` field.
    pub fn from_value(body: Value) -> Result<Self> {
        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::logical("manifest has no kind"))?
            .parse()?;
        Ok(Self { kind, body })
    }

    /// Parse a rendered manifest (YAML or JSON) into its documents.
    pub fn parse_manifest(text: &str) -> Result<Vec<Self>> {
        let mut resources = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let value = Value::deserialize(doc)?;
            if value.is_null() {
                continue;
            }
            resources.push(Self::from_value(value)?);
        }
        Ok(resources)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.get("metadata.name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind, self.name())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.body
            .get("metadata")?
            .get("labels")?
            .get(key)?
            .as_str()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.body
            .get("metadata")?
            .get("annotations")?
            .get(key)?
            .as_str()
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let annotations = self.entry_mut("metadata.annotations");
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        if let Value::Object(map) = annotations {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let removed = self
            .body
            .get_mut("metadata")?
            .get_mut("annotations")?
            .as_object_mut()?
            .remove(key)?;
        removed.as_str().map(String::from)
    }

    /// Read a dotted path (`status.readyReplicas`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        json_path(&self.body, path)
    }

    pub fn set(&mut self, path: &str, value: Value) {
        *self.entry_mut(path) = value;
    }

    fn entry_mut(&mut self, path: &str) -> &mut Value {
        let mut current = &mut self.body;
        for segment in path.split('.') {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
                _ => unreachable!("replaced with an object above"),
            };
        }
        current
    }

    pub fn body(&self) -> &Value {
        &self.body
    }
}

pub(crate) fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

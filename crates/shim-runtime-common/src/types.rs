//! Shared value types: runtime kinds and capability requirements.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Well-known capability names.
pub mod caps {
    /// Backend can create a drawable canvas surface.
    pub const CREATE_CANVAS: &str = "create_canvas";
    /// Backend can display media inside its shim container.
    pub const DISPLAY_MEDIA: &str = "display_media";
    /// Backend can embed data URIs up to the given size in bytes.
    pub const USE_DATA_URI_OF: &str = "use_data_uri_of";
    /// Backend can read files as binary strings.
    pub const READ_BINARY: &str = "read_binary";
    /// Backend can send multipart request bodies.
    pub const SEND_MULTIPART: &str = "send_multipart";
    /// Backend can resize images.
    pub const RESIZE_IMAGE: &str = "resize_image";
}

/// A backend execution environment.
///
/// The four built-in kinds are the classic shim environments; any other
/// name is carried as [`RuntimeKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeKind {
    /// Native HTML5 APIs.
    Html5,
    /// Legacy HTML4 shims (form posts, iframes).
    Html4,
    /// Flash plugin.
    Flash,
    /// Silverlight plugin.
    Silverlight,
    /// Any other registered backend.
    Custom(String),
}

impl RuntimeKind {
    /// The canonical lowercase name.
    pub fn as_str(&self) -> &str {
        match self {
            RuntimeKind::Html5 => "html5",
            RuntimeKind::Html4 => "html4",
            RuntimeKind::Flash => "flash",
            RuntimeKind::Silverlight => "silverlight",
            RuntimeKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Ok(match lowered.as_str() {
            "html5" => RuntimeKind::Html5,
            "html4" => RuntimeKind::Html4,
            "flash" => RuntimeKind::Flash,
            "silverlight" => RuntimeKind::Silverlight,
            _ => RuntimeKind::Custom(lowered),
        })
    }
}

impl From<&str> for RuntimeKind {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl Serialize for RuntimeKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RuntimeKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RuntimeKind::from(s.as_str()))
    }
}

/// The value a capability is requested with (or provided as).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    /// Plain on/off capability.
    Bool(bool),
    /// Numeric capability, usually a size limit.
    Int(i64),
    /// Free-form capability value (e.g. a mime type).
    Text(String),
}

impl CapabilityValue {
    /// Parse a value as written on a command line: `true`/`false`, an
    /// integer, or anything else as text.
    pub fn parse(s: &str) -> Self {
        match s {
            "true" => CapabilityValue::Bool(true),
            "false" => CapabilityValue::Bool(false),
            _ => s
                .parse::<i64>()
                .map_or_else(|_| CapabilityValue::Text(s.to_string()), CapabilityValue::Int),
        }
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{b}"),
            CapabilityValue::Int(i) => write!(f, "{i}"),
            CapabilityValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for CapabilityValue {
    fn from(b: bool) -> Self {
        CapabilityValue::Bool(b)
    }
}

impl From<i64> for CapabilityValue {
    fn from(i: i64) -> Self {
        CapabilityValue::Int(i)
    }
}

impl From<&str> for CapabilityValue {
    fn from(s: &str) -> Self {
        CapabilityValue::Text(s.to_string())
    }
}

/// A single `{capability_name: required_value}` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    /// Capability name (e.g. `display_media`).
    pub name: String,
    /// The value the backend must satisfy.
    pub value: CapabilityValue,
    /// Optional requirements never disqualify a backend, but distinguish
    /// otherwise identical runtime configurations.
    #[serde(default)]
    pub optional: bool,
}

/// An ordered, conjunctive list of capability requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilitySet {
    requirements: Vec<Requirement>,
}

impl CapabilitySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required capability.
    #[must_use]
    pub fn require(mut self, name: impl Into<String>, value: impl Into<CapabilityValue>) -> Self {
        self.push(name.into(), value.into(), false);
        self
    }

    /// Add an optional capability.
    #[must_use]
    pub fn prefer(mut self, name: impl Into<String>, value: impl Into<CapabilityValue>) -> Self {
        self.push(name.into(), value.into(), true);
        self
    }

    // A later entry for the same name replaces the earlier one in place.
    fn push(&mut self, name: String, value: CapabilityValue, optional: bool) {
        let req = Requirement {
            name,
            value,
            optional,
        };
        match self.requirements.iter_mut().find(|r| r.name == req.name) {
            Some(existing) => *existing = req,
            None => self.requirements.push(req),
        }
    }

    /// All entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter()
    }

    /// Required (non-optional) entries.
    pub fn required(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.optional)
    }

    /// Optional entries.
    pub fn optional(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| r.optional)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .requirements
            .iter()
            .map(|r| {
                let marker = if r.optional { "?" } else { "" };
                format!("{}{marker}={}", r.name, r.value)
            })
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(RuntimeKind::from("HTML5"), RuntimeKind::Html5);
        assert_eq!(RuntimeKind::from("flash"), RuntimeKind::Flash);
        assert_eq!(
            RuntimeKind::from("Native"),
            RuntimeKind::Custom("native".into())
        );
        assert_eq!(RuntimeKind::Silverlight.to_string(), "silverlight");
    }

    #[test]
    fn test_kind_serde() {
        let kinds: Vec<RuntimeKind> = serde_json::from_str(r#"["html4", "wasm"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![RuntimeKind::Html4, RuntimeKind::Custom("wasm".into())]
        );
        assert_eq!(
            serde_json::to_string(&RuntimeKind::Flash).unwrap(),
            r#""flash""#
        );
    }

    #[test]
    fn test_capability_value_parse() {
        assert_eq!(CapabilityValue::parse("true"), CapabilityValue::Bool(true));
        assert_eq!(CapabilityValue::parse("32768"), CapabilityValue::Int(32768));
        assert_eq!(
            CapabilityValue::parse("image/png"),
            CapabilityValue::Text("image/png".into())
        );
    }

    #[test]
    fn test_capability_set_replaces_duplicates() {
        let set = CapabilitySet::new()
            .require("display_media", true)
            .require("create_canvas", true)
            .prefer("display_media", false);

        assert_eq!(set.len(), 2);
        assert_eq!(set.required().count(), 1);
        assert_eq!(set.optional().count(), 1);
        assert_eq!(set.to_string(), "display_media?=false, create_canvas=true");
    }
}

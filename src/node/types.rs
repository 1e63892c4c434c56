/// Core node type definitions
///
/// Defines node definitions, their parameter schema and the items that flow between
/// ports. Schemas are serialized to JSON for persistence; execute logic is not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::runtime::ExecutionContext;

/// Atomic data unit flowing between node ports
///
/// Uses n8n-style wrapping: the payload lives under `json`, so even a single record
/// travels as `{ "json": { ... } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Arbitrary record fields
    pub json: Map<String, Value>,
    /// Index of the input item this item was derived from, when known
    #[serde(rename = "pairedItem", default, skip_serializing_if = "Option::is_none")]
    pub paired_item: Option<Value>,
}

impl Item {
    pub fn new(json: Map<String, Value>) -> Self {
        Self {
            json,
            paired_item: None,
        }
    }

    /// Wrap an arbitrary JSON value into an item
    ///
    /// `{ "json": {...} }` is taken as an already-wrapped item, any other object becomes
    /// the item's fields, and scalars/arrays land under a `value` field.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut obj) => {
                if matches!(obj.get("json"), Some(Value::Object(_))) {
                    let paired_item = obj.remove("pairedItem");
                    if let Some(Value::Object(json)) = obj.remove("json") {
                        return Self { json, paired_item };
                    }
                }
                Self::new(obj)
            }
            other => {
                let mut json = Map::new();
                json.insert("value".to_string(), other);
                Self::new(json)
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Raw per-port result produced by one pass of node logic
///
/// Keys are port or branch names ("main", "true", ...), values are arrays of items.
pub type OutputEntry = Map<String, Value>;

/// Closed set of parameter types understood by the editor and the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Options,
    MultiOptions,
    Json,
    DateTime,
    Collection,
    FixedCollection,
    Color,
    Hidden,
    Notice,
    Credential,
    ResourceLocator,
    Custom,
    /// A type name outside the closed set; kept so validation can report it
    Unknown(String),
}

impl PropertyType {
    pub fn as_str(&self) -> &str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Options => "options",
            PropertyType::MultiOptions => "multiOptions",
            PropertyType::Json => "json",
            PropertyType::DateTime => "dateTime",
            PropertyType::Collection => "collection",
            PropertyType::FixedCollection => "fixedCollection",
            PropertyType::Color => "color",
            PropertyType::Hidden => "hidden",
            PropertyType::Notice => "notice",
            PropertyType::Credential => "credential",
            PropertyType::ResourceLocator => "resourceLocator",
            PropertyType::Custom => "custom",
            PropertyType::Unknown(raw) => raw,
        }
    }

    pub fn requires_options(&self) -> bool {
        matches!(self, PropertyType::Options | PropertyType::MultiOptions)
    }
}

impl From<String> for PropertyType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "string" => PropertyType::String,
            "number" => PropertyType::Number,
            "boolean" => PropertyType::Boolean,
            "options" => PropertyType::Options,
            "multiOptions" => PropertyType::MultiOptions,
            "json" => PropertyType::Json,
            "dateTime" => PropertyType::DateTime,
            "collection" => PropertyType::Collection,
            "fixedCollection" => PropertyType::FixedCollection,
            "color" => PropertyType::Color,
            "hidden" => PropertyType::Hidden,
            "notice" => PropertyType::Notice,
            "credential" | "credentials" => PropertyType::Credential,
            "resourceLocator" => PropertyType::ResourceLocator,
            "custom" => PropertyType::Custom,
            _ => PropertyType::Unknown(raw),
        }
    }
}

impl From<PropertyType> for String {
    fn from(property_type: PropertyType) -> Self {
        property_type.as_str().to_string()
    }
}

/// One selectable value of an options/multiOptions property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyOption {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Conditional visibility keyed on sibling parameter values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayOptions {
    #[serde(default)]
    pub show: HashMap<String, Vec<Value>>,
    #[serde(default)]
    pub hide: HashMap<String, Vec<Value>>,
}

/// One parameter schema entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProperty {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<PropertyOption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_options: Option<DisplayOptions>,
    /// Value is taken literally; `{{ }}` inside it is not evaluated
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_data_expression: bool,
}

impl NodeProperty {
    pub fn new(name: &str, display_name: &str, property_type: PropertyType) -> Self {
        Self {
            display_name: display_name.to_string(),
            name: name.to_string(),
            property_type,
            required: false,
            default: Value::Null,
            description: None,
            options: None,
            display_options: None,
            no_data_expression: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    pub fn verbatim(mut self) -> Self {
        self.no_data_expression = true;
        self
    }

    pub fn with_options(mut self, options: Vec<PropertyOption>) -> Self {
        self.options = Some(options);
        self
    }

    /// Evaluate `display_options` against sibling parameter values
    ///
    /// Shown when every `show` key matches one of its listed values and no `hide` key
    /// matches. A property without display options is always visible.
    pub fn is_visible(&self, params: &Map<String, Value>) -> bool {
        let Some(display) = &self.display_options else {
            return true;
        };

        let show_ok = display.show.iter().all(|(key, allowed)| {
            params
                .get(key)
                .map(|actual| allowed.contains(actual))
                .unwrap_or(false)
        });
        let hidden = display.hide.iter().any(|(key, blocked)| {
            params
                .get(key)
                .map(|actual| blocked.contains(actual))
                .unwrap_or(false)
        });

        show_ok && !hidden
    }
}

/// Parameter schema source: a static list or a zero-arg generator
///
/// The generator is invoked exactly once, at registration time.
#[derive(Clone)]
pub enum Properties {
    Static(Vec<NodeProperty>),
    Generator(fn() -> Vec<NodeProperty>),
}

impl Properties {
    pub fn resolve(&self) -> Vec<NodeProperty> {
        match self {
            Properties::Static(list) => list.clone(),
            Properties::Generator(generate) => generate(),
        }
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Properties::Static(list) => f.debug_tuple("Static").field(&list.len()).finish(),
            Properties::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// What kind of work a node does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionCapability {
    Trigger,
    Action,
    Transform,
    Condition,
}

/// Credential types a node may request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCredentialDescription {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

/// Node logic implemented on the host
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Run the node over its input items and return raw per-port entries
    async fn execute(&self, ctx: &ExecutionContext, input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>>;
}

/// Dynamic option lists for options-type properties
#[async_trait]
pub trait LoadOptions: Send + Sync {
    async fn load_options(&self, method: &str, ctx: &ExecutionContext) -> anyhow::Result<Vec<PropertyOption>>;
}

/// How a node's execute capability is provided
#[derive(Clone)]
pub enum NodeLogic {
    /// Built-in or user-authored handler running on the host
    Host(Arc<dyn NodeHandler>),
    /// Lua source executed in the sandbox for every call
    Script(String),
}

impl fmt::Debug for NodeLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeLogic::Host(_) => f.write_str("Host(..)"),
            NodeLogic::Script(source) => write!(f, "Script({} bytes)", source.len()),
        }
    }
}

/// A registered node type
#[derive(Clone)]
pub struct NodeDefinition {
    /// Unique registry key (e.g. "nodeward.httpRequest")
    pub identifier: String,
    pub display_name: String,
    pub name: String,
    pub group: Vec<String>,
    pub version: u32,
    pub description: String,
    /// Ordered input port names
    pub inputs: Vec<String>,
    /// Ordered output port names; order is meaningful for positional multi-output nodes
    pub outputs: Vec<String>,
    pub properties: Properties,
    pub credentials: Vec<NodeCredentialDescription>,
    /// Explicit category, takes priority over group inference
    pub node_category: Option<ExecutionCapability>,
    pub logic: NodeLogic,
    pub load_options: Option<Arc<dyn LoadOptions>>,
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("identifier", &self.identifier)
            .field("version", &self.version)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("properties", &self.properties)
            .field("logic", &self.logic)
            .finish()
    }
}

impl NodeDefinition {
    /// Minimal definition with a single main input and output
    pub fn new(identifier: &str, display_name: &str, logic: NodeLogic) -> Self {
        Self {
            identifier: identifier.to_string(),
            display_name: display_name.to_string(),
            name: identifier.to_string(),
            group: vec!["transform".to_string()],
            version: 1,
            description: display_name.to_string(),
            inputs: vec!["main".to_string()],
            outputs: vec!["main".to_string()],
            properties: Properties::Static(Vec::new()),
            credentials: Vec::new(),
            node_category: None,
            logic,
            load_options: None,
        }
    }

    /// Rebuild a definition from a persisted schema plus its logic
    pub fn from_schema(schema: NodeSchema, logic: NodeLogic) -> Self {
        Self {
            identifier: schema.identifier,
            display_name: schema.display_name,
            name: schema.name,
            group: schema.group,
            version: schema.version,
            description: schema.description,
            inputs: schema.inputs,
            outputs: schema.outputs,
            properties: Properties::Static(schema.properties),
            credentials: schema.credentials,
            node_category: schema.node_category,
            logic,
            load_options: None,
        }
    }

    /// Serializable view of the definition (logic excluded)
    pub fn schema(&self) -> NodeSchema {
        NodeSchema {
            identifier: self.identifier.clone(),
            display_name: self.display_name.clone(),
            name: self.name.clone(),
            group: self.group.clone(),
            version: self.version,
            description: self.description.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            properties: self.properties.resolve(),
            credentials: self.credentials.clone(),
            node_category: self.node_category,
        }
    }

    /// Derive the execution capability: explicit category first, then group membership
    pub fn execution_capability(&self) -> ExecutionCapability {
        if let Some(category) = self.node_category {
            return category;
        }

        let in_group = |names: &[&str]| {
            self.group
                .iter()
                .any(|g| names.iter().any(|n| g.eq_ignore_ascii_case(n)))
        };

        if in_group(&["trigger", "schedule"]) {
            ExecutionCapability::Trigger
        } else if in_group(&["condition", "logic", "flow"]) {
            ExecutionCapability::Condition
        } else if in_group(&["transform"]) {
            ExecutionCapability::Transform
        } else {
            ExecutionCapability::Action
        }
    }

    /// Static property list if already resolved
    pub fn resolved_properties(&self) -> Vec<NodeProperty> {
        self.properties.resolve()
    }
}

/// Persistable node schema (everything but the execute capability)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSchema {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: Vec<String>,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub properties: Vec<NodeProperty>,
    #[serde(default)]
    pub credentials: Vec<NodeCredentialDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_category: Option<ExecutionCapability>,
}

//! Plain views of the descriptors, referencing other types by fully-qualified name so that
//! recursive schemas stay finite.
use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor, MethodDescriptor, ServiceDescriptor};
use std::fmt;

/// The four gRPC call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl CallShape {
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => CallShape::Unary,
            (false, true) => CallShape::ServerStreaming,
            (true, false) => CallShape::ClientStreaming,
            (true, true) => CallShape::Bidirectional,
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallShape::Unary => "unary",
            CallShape::ServerStreaming => "server streaming",
            CallShape::ClientStreaming => "client streaming",
            CallShape::Bidirectional => "bidirectional streaming",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub full_name: String,
    /// Fully-qualified name of the owning service.
    pub service: String,
    pub input: String,
    pub output: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodInfo {
    pub fn from_descriptor(method: &MethodDescriptor) -> Self {
        Self {
            name: method.name().to_string(),
            full_name: method.full_name().to_string(),
            service: method.parent_service().full_name().to_string(),
            input: method.input().full_name().to_string(),
            output: method.output().full_name().to_string(),
            client_streaming: method.is_client_streaming(),
            server_streaming: method.is_server_streaming(),
        }
    }

    pub fn shape(&self) -> CallShape {
        CallShape::from_flags(self.client_streaming, self.server_streaming)
    }

    /// `package.Service/Method`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.service, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub full_name: String,
    /// Shortest unambiguous name among the listed services.
    pub display_name: String,
    /// Sorted by name.
    pub methods: Vec<MethodInfo>,
    /// Set when the service's files could not be fetched or linked.
    pub resolution_error: Option<String>,
}

impl ServiceInfo {
    pub fn from_descriptor(service: &ServiceDescriptor) -> Self {
        let mut methods: Vec<_> = service.methods().map(|m| MethodInfo::from_descriptor(&m)).collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            full_name: service.full_name().to_string(),
            display_name: service.name().to_string(),
            methods,
            resolution_error: None,
        }
    }

    pub(crate) fn unresolved(full_name: &str, error: String) -> Self {
        Self {
            full_name: full_name.to_string(),
            display_name: full_name.rsplit('.').next().unwrap_or(full_name).to_string(),
            methods: Vec::new(),
            resolution_error: Some(error),
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
    Enum(String),
    Message(String),
    Map {
        key: Box<FieldKind>,
        value: Box<FieldKind>,
    },
}

impl FieldKind {
    fn of(kind: &Kind) -> Self {
        match kind {
            Kind::Double => FieldKind::Double,
            Kind::Float => FieldKind::Float,
            Kind::Int32 => FieldKind::Int32,
            Kind::Int64 => FieldKind::Int64,
            Kind::Uint32 => FieldKind::Uint32,
            Kind::Uint64 => FieldKind::Uint64,
            Kind::Sint32 => FieldKind::Sint32,
            Kind::Sint64 => FieldKind::Sint64,
            Kind::Fixed32 => FieldKind::Fixed32,
            Kind::Fixed64 => FieldKind::Fixed64,
            Kind::Sfixed32 => FieldKind::Sfixed32,
            Kind::Sfixed64 => FieldKind::Sfixed64,
            Kind::Bool => FieldKind::Bool,
            Kind::String => FieldKind::String,
            Kind::Bytes => FieldKind::Bytes,
            Kind::Enum(e) => FieldKind::Enum(e.full_name().to_string()),
            Kind::Message(m) => FieldKind::Message(m.full_name().to_string()),
        }
    }

    /// The referenced message, if any (the value type for maps).
    pub fn message_name(&self) -> Option<&str> {
        match self {
            FieldKind::Message(name) => Some(name),
            FieldKind::Map { value, .. } => value.message_name(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Enum(name) | FieldKind::Message(name) => f.write_str(name),
            FieldKind::Map { key, value } => write!(f, "map<{key}, {value}>"),
            scalar => write!(f, "{}", format!("{scalar:?}").to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Singular,
    Optional,
    Repeated,
    Map,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub json_name: String,
    pub number: u32,
    pub kind: FieldKind,
    pub cardinality: Cardinality,
    /// Name of the real (non-synthetic) oneof containing the field.
    pub oneof: Option<String>,
    /// Whether the field distinguishes "unset" from its zero value.
    pub presence: bool,
}

impl FieldInfo {
    pub fn from_descriptor(field: &FieldDescriptor) -> Self {
        let kind = field.kind();
        let containing = field.containing_oneof();

        let (field_kind, cardinality) = if field.is_map() {
            let entry = kind.as_message();
            let key = entry.map(|e| FieldKind::of(&e.map_entry_key_field().kind()));
            let value = entry.map(|e| FieldKind::of(&e.map_entry_value_field().kind()));
            (
                FieldKind::Map {
                    key: Box::new(key.unwrap_or(FieldKind::String)),
                    value: Box::new(value.unwrap_or(FieldKind::String)),
                },
                Cardinality::Map,
            )
        } else if field.is_list() {
            (FieldKind::of(&kind), Cardinality::Repeated)
        } else {
            let cardinality = match &containing {
                Some(oneof) if oneof.is_synthetic() || oneof.fields().count() == 1 => {
                    Cardinality::Optional
                }
                Some(_) => Cardinality::Singular,
                None if field.supports_presence() && !matches!(kind, Kind::Message(_)) => {
                    Cardinality::Optional
                }
                None => Cardinality::Singular,
            };
            (FieldKind::of(&kind), cardinality)
        };

        Self {
            name: field.name().to_string(),
            json_name: field.json_name().to_string(),
            number: field.number(),
            kind: field_kind,
            cardinality,
            oneof: containing
                .filter(|oneof| !oneof.is_synthetic())
                .map(|oneof| oneof.name().to_string()),
            presence: field.supports_presence(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneofInfo {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub full_name: String,
    /// In declaration order.
    pub fields: Vec<FieldInfo>,
    /// Real oneofs only.
    pub oneofs: Vec<OneofInfo>,
}

impl MessageInfo {
    pub fn from_descriptor(message: &MessageDescriptor) -> Self {
        Self {
            full_name: message.full_name().to_string(),
            fields: message.fields().map(|f| FieldInfo::from_descriptor(&f)).collect(),
            oneofs: message
                .oneofs()
                .filter(|oneof| !oneof.is_synthetic())
                .map(|oneof| OneofInfo {
                    name: oneof.name().to_string(),
                    fields: oneof.fields().map(|f| f.name().to_string()).collect(),
                })
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }
}

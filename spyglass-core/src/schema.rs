//! # Schema Cache & Resolver
//!
//! Resolves services, methods and messages on demand through server reflection and keeps
//! them for the lifetime of one connection.
//!
//! All fetched files are merged into a single `DescriptorPool`. Before a batch is merged,
//! files the pool already holds are dropped, so concurrent resolutions of overlapping
//! symbols are harmless: they may fetch twice, but they link once.
//!
//! Reflection failures are surfaced to the caller once and never retried here.
use crate::BoxError;
use crate::reflection::client::{ReflectionClient, ReflectionResolveError};
use http_body::Body as HttpBody;
use parking_lot::RwLock;
use prost_reflect::{
    DescriptorError, DescriptorPool, EnumDescriptor, Kind, MessageDescriptor, MethodDescriptor,
    ServiceDescriptor,
};
use prost_types::FileDescriptorSet;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tonic::client::GrpcService;
use tonic::transport::Channel;

mod display;
mod model;
mod template;

pub use display::display_names;
pub use model::{
    CallShape, Cardinality, FieldInfo, FieldKind, MessageInfo, MethodInfo, OneofInfo, ServiceInfo,
};
pub use template::message_template;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("The server does not expose the reflection service: '{}'", .0.message())]
    ReflectionUnavailable(tonic::Status),

    #[error(transparent)]
    Reflection(ReflectionResolveError),

    #[error("Symbol '{0}' could not be resolved")]
    SymbolNotFound(String),

    #[error("Method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },

    #[error("Failed to link descriptors: '{0}'")]
    Descriptor(#[from] DescriptorError),
}

impl SchemaError {
    /// Whether reflection itself is unusable, as opposed to a single symbol failing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchemaError::ReflectionUnavailable(_)
                | SchemaError::Reflection(
                    ReflectionResolveError::ServerStreamInitFailed(_)
                        | ReflectionResolveError::StreamClosed
                        | ReflectionResolveError::SendFailed
                )
        )
    }
}

impl From<ReflectionResolveError> for SchemaError {
    fn from(err: ReflectionResolveError) -> Self {
        match err {
            ReflectionResolveError::ServerStreamInitFailed(status)
                if status.code() == tonic::Code::Unimplemented =>
            {
                SchemaError::ReflectionUnavailable(status)
            }
            other => SchemaError::Reflection(other),
        }
    }
}

/// A wrapper around the descriptor kinds a symbol can name.
#[derive(Debug, Clone)]
pub enum Descriptor {
    MessageDescriptor(MessageDescriptor),
    ServiceDescriptor(ServiceDescriptor),
    EnumDescriptor(EnumDescriptor),
}

impl Descriptor {
    pub fn name(&self) -> &str {
        match self {
            Descriptor::MessageDescriptor(v) => v.name(),
            Descriptor::ServiceDescriptor(v) => v.name(),
            Descriptor::EnumDescriptor(v) => v.name(),
        }
    }

    pub fn full_name(&self) -> &str {
        match self {
            Descriptor::MessageDescriptor(v) => v.full_name(),
            Descriptor::ServiceDescriptor(v) => v.full_name(),
            Descriptor::EnumDescriptor(v) => v.full_name(),
        }
    }

    pub fn package_name(&self) -> &str {
        match self {
            Descriptor::MessageDescriptor(v) => v.package_name(),
            Descriptor::ServiceDescriptor(v) => v.package_name(),
            Descriptor::EnumDescriptor(v) => v.package_name(),
        }
    }
}

/// Everything needed to call a method.
#[derive(Debug, Clone)]
pub struct MethodSchema {
    pub info: MethodInfo,
    pub descriptor: MethodDescriptor,
    pub input: MessageInfo,
    pub output: MessageInfo,
}

pub struct SchemaCache<S = Channel> {
    reflection: Mutex<ReflectionClient<S>>,
    pool: RwLock<DescriptorPool>,
    services: RwLock<HashMap<String, ServiceInfo>>,
    messages: RwLock<HashMap<String, MessageInfo>>,
}

impl<S> SchemaCache<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        Self {
            reflection: Mutex::new(ReflectionClient::new(service)),
            pool: RwLock::new(DescriptorPool::new()),
            services: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
        }
    }

    /// A snapshot of every descriptor fetched so far.
    pub fn pool(&self) -> DescriptorPool {
        self.pool.read().clone()
    }

    /// Fully-qualified names of the services the server advertises, sorted.
    pub async fn list_services(&self) -> Result<Vec<String>, SchemaError> {
        let mut services = self.reflection.lock().await.list_services().await?;
        services.sort();
        services.dedup();
        Ok(services)
    }

    /// Resolves a service and its methods.
    ///
    /// # Returns
    ///
    /// * `Ok(ServiceInfo)` - The service. If its files could not be fetched or linked it has
    ///   no methods and `resolution_error` explains why.
    /// * `Err(SchemaError)` - Reflection itself is unusable.
    pub async fn resolve_service(&self, name: &str) -> Result<ServiceInfo, SchemaError> {
        if let Some(service) = self.services.read().get(name) {
            return Ok(service.clone());
        }

        let info = match self.service_descriptor(name).await {
            Ok(service) => ServiceInfo::from_descriptor(&service),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::debug!(service = name, error = %err, "Service could not be resolved");
                // Not cached: the next explicit resolve tries again.
                return Ok(ServiceInfo::unresolved(name, err.to_string()));
            }
        };

        self.services
            .write()
            .insert(name.to_string(), info.clone());

        Ok(info)
    }

    /// Lists and resolves every service, with disambiguated display names.
    pub async fn load_services(&self) -> Result<Vec<ServiceInfo>, SchemaError> {
        let names = self.list_services().await?;

        let mut services = Vec::with_capacity(names.len());
        for name in &names {
            services.push(self.resolve_service(name).await?);
        }

        for (service, label) in services.iter_mut().zip(display_names(&names)) {
            service.display_name = label;
        }

        Ok(services)
    }

    /// Resolves a method together with its input and output messages.
    ///
    /// # Arguments
    ///
    /// * `service` - Fully-qualified service name.
    /// * `method` - Simple method name.
    pub async fn resolve_method(
        &self,
        service: &str,
        method: &str,
    ) -> Result<MethodSchema, SchemaError> {
        let descriptor = self
            .service_descriptor(service)
            .await?
            .methods()
            .find(|m| m.name() == method)
            .ok_or_else(|| SchemaError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })?;

        Ok(MethodSchema {
            info: MethodInfo::from_descriptor(&descriptor),
            input: self.message_info(&descriptor.input()),
            output: self.message_info(&descriptor.output()),
            descriptor,
        })
    }

    /// Resolves a message by fully-qualified name.
    pub async fn resolve_message(&self, full_name: &str) -> Result<MessageInfo, SchemaError> {
        if let Some(info) = self.messages.read().get(full_name) {
            return Ok(info.clone());
        }

        let desc = self.message_descriptor(full_name).await?;
        Ok(self.message_info(&desc))
    }

    pub async fn message_descriptor(&self, full_name: &str) -> Result<MessageDescriptor, SchemaError> {
        match self.describe_symbol(full_name).await? {
            Descriptor::MessageDescriptor(desc) => Ok(desc),
            _ => Err(SchemaError::SymbolNotFound(full_name.to_string())),
        }
    }

    /// Looks up a service, message or enum, fetching its file if needed.
    pub async fn describe_symbol(&self, symbol: &str) -> Result<Descriptor, SchemaError> {
        if let Some(descriptor) = self.lookup(symbol) {
            return Ok(descriptor);
        }

        let fd_set = self
            .reflection
            .lock()
            .await
            .file_descriptor_set_by_symbol(symbol)
            .await?;
        self.merge(fd_set)?;

        self.lookup(symbol)
            .ok_or_else(|| SchemaError::SymbolNotFound(symbol.to_string()))
    }

    /// A JSON skeleton of the message, for pre-filling a request.
    pub async fn message_template(&self, full_name: &str) -> Result<serde_json::Value, SchemaError> {
        let desc = self.message_descriptor(full_name).await?;
        Ok(message_template(&desc))
    }

    /// Extension numbers the server knows for `containing_type`.
    pub async fn extension_numbers(&self, containing_type: &str) -> Result<Vec<i32>, SchemaError> {
        Ok(self
            .reflection
            .lock()
            .await
            .all_extension_numbers(containing_type)
            .await?)
    }

    /// Fetches and merges the file declaring extension `number` of `containing_type`.
    pub async fn load_extension(&self, containing_type: &str, number: i32) -> Result<(), SchemaError> {
        let fd_set = self
            .reflection
            .lock()
            .await
            .file_containing_extension(containing_type, number)
            .await?;
        self.merge(fd_set)
    }

    async fn service_descriptor(&self, name: &str) -> Result<ServiceDescriptor, SchemaError> {
        match self.describe_symbol(name).await? {
            Descriptor::ServiceDescriptor(service) => Ok(service),
            _ => Err(SchemaError::SymbolNotFound(name.to_string())),
        }
    }

    fn lookup(&self, symbol: &str) -> Option<Descriptor> {
        let pool = self.pool.read();
        pool.get_service_by_name(symbol)
            .map(Descriptor::ServiceDescriptor)
            .or_else(|| pool.get_message_by_name(symbol).map(Descriptor::MessageDescriptor))
            .or_else(|| pool.get_enum_by_name(symbol).map(Descriptor::EnumDescriptor))
    }

    fn merge(&self, fd_set: FileDescriptorSet) -> Result<(), SchemaError> {
        let mut pool = self.pool.write();

        let files: Vec<_> = fd_set
            .file
            .into_iter()
            .filter(|file| {
                file.name
                    .as_deref()
                    .is_some_and(|name| pool.get_file_by_name(name).is_none())
            })
            .collect();

        if files.is_empty() {
            return Ok(());
        }

        let count = files.len();
        // Link into a copy so a failed batch leaves the pool untouched.
        let mut next = pool.clone();
        next.add_file_descriptor_protos(files)?;
        *pool = next;

        tracing::debug!(files = count, "Merged descriptors into the schema cache");
        Ok(())
    }

    /// Builds (and caches) the info for `root` and every message reachable from it.
    fn message_info(&self, root: &MessageDescriptor) -> MessageInfo {
        if let Some(info) = self.messages.read().get(root.full_name()) {
            return info.clone();
        }

        let mut visited = HashSet::new();
        let mut pending = vec![root.clone()];
        let mut built = Vec::new();

        while let Some(desc) = pending.pop() {
            if !visited.insert(desc.full_name().to_string()) {
                continue;
            }

            for field in desc.fields() {
                if let Kind::Message(child) = field.kind() {
                    if child.is_map_entry() {
                        if let Kind::Message(value) = child.map_entry_value_field().kind() {
                            pending.push(value);
                        }
                    } else {
                        pending.push(child);
                    }
                }
            }

            built.push(MessageInfo::from_descriptor(&desc));
        }

        let mut messages = self.messages.write();
        for info in built {
            messages.entry(info.full_name.clone()).or_insert(info);
        }

        messages
            .get(root.full_name())
            .cloned()
            .unwrap_or_else(|| MessageInfo::from_descriptor(root))
    }
}

//! Terminal rendering of everything the CLI prints.
use colored::*;
use spyglass_core::error::ErrorReport;
use spyglass_core::invoker::{BufferStats, ReceivedMessage, StreamEnd};
use spyglass_core::prost_reflect::{
    EnumDescriptor, Kind, MessageDescriptor, MethodDescriptor, ServiceDescriptor,
};
use spyglass_core::schema::Descriptor;
use spyglass_core::schema::ServiceInfo;
use spyglass_core::state::format_duration;
use spyglass_core::storage::{CallRecord, CallStatus, Workspace};
use spyglass_core::{Endpoint, UnaryResponse};
use std::fmt::Write as _;
use std::time::Duration;

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

pub struct ServiceList(pub Vec<ServiceInfo>);

pub struct EndpointList(pub Vec<Endpoint>);

pub struct HistoryList(pub Vec<CallRecord>);

pub struct WorkspaceList(pub Vec<String>);

/// The closing line of a response stream.
pub struct StreamSummary(pub StreamEnd, pub BufferStats, pub Duration);

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<serde_json::Value> for FormattedString {
    fn from(value: serde_json::Value) -> Self {
        FormattedString(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
    }
}

impl From<&ErrorReport> for FormattedString {
    fn from(report: &ErrorReport) -> Self {
        let mut out = format!(
            "{} {}\n\n'{}'",
            format!("{}:", report.title).red().bold(),
            format!("[{}]", report.kind).dimmed(),
            report.message
        );
        for hint in &report.hints {
            let _ = write!(out, "\n  {} {hint}", "hint:".yellow());
        }
        FormattedString(out)
    }
}

impl From<&UnaryResponse> for FormattedString {
    fn from(response: &UnaryResponse) -> Self {
        let mut out = response.text().to_string();
        let _ = write!(
            out,
            "\n\n{} {}, {} bytes",
            "took".dimmed(),
            format_duration(response.duration),
            response.size
        );
        for (key, value) in &response.metadata {
            let _ = write!(out, "\n  {}: {value}", key.cyan());
        }
        FormattedString(out)
    }
}

impl From<&ReceivedMessage> for FormattedString {
    fn from(message: &ReceivedMessage) -> Self {
        FormattedString(format!("{}\n{}", format!("#{}", message.seq).dimmed(), message.text))
    }
}

impl From<StreamSummary> for FormattedString {
    fn from(StreamSummary(end, stats, elapsed): StreamSummary) -> Self {
        let outcome = match &end {
            StreamEnd::Completed { .. } => "Stream completed".green().bold(),
            StreamEnd::Failed(_) => "Stream failed".red().bold(),
            StreamEnd::Cancelled => "Stream cancelled".yellow().bold(),
        };
        let mut out = format!(
            "{outcome}: {} messages in {}",
            stats.total,
            format_duration(elapsed)
        );
        if stats.truncated {
            let _ = write!(out, " ({} kept)", stats.visible);
        }
        if let StreamEnd::Completed { trailers } = &end {
            for (key, value) in trailers {
                let _ = write!(out, "\n  {}: {value}", key.cyan());
            }
        }
        FormattedString(out)
    }
}

impl From<ServiceList> for FormattedString {
    fn from(ServiceList(services): ServiceList) -> Self {
        if services.is_empty() {
            return FormattedString("No services found.".yellow().to_string());
        }

        let mut out = String::from("Available Services:\n");
        for service in services {
            let _ = write!(out, "  - {}", service.display_name.green());
            if service.display_name != service.full_name {
                let _ = write!(out, " {}", format!("({})", service.full_name).dimmed());
            }
            out.push('\n');

            if let Some(reason) = &service.resolution_error {
                let _ = writeln!(out, "      {} {reason}", "unresolved:".red());
                continue;
            }
            for method in &service.methods {
                let _ = writeln!(
                    out,
                    "      {} {}",
                    method.name,
                    format!("[{}]", method.shape()).dimmed()
                );
            }
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<EndpointList> for FormattedString {
    fn from(EndpointList(endpoints): EndpointList) -> Self {
        if endpoints.is_empty() {
            return FormattedString("No recent endpoints.".yellow().to_string());
        }

        let mut out = String::from("Recent Endpoints:\n");
        for endpoint in endpoints {
            let _ = writeln!(out, "  - {}", endpoint.uri().green());
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<WorkspaceList> for FormattedString {
    fn from(WorkspaceList(names): WorkspaceList) -> Self {
        if names.is_empty() {
            return FormattedString("No saved workspaces.".yellow().to_string());
        }

        let mut out = String::from("Workspaces:\n");
        for name in names {
            let _ = writeln!(out, "  - {}", name.green());
        }
        FormattedString(out.trim_end().to_string())
    }
}

fn status_label(status: CallStatus) -> ColoredString {
    match status {
        CallStatus::Success => "ok".green(),
        CallStatus::Error => "error".red(),
    }
}

impl From<HistoryList> for FormattedString {
    fn from(HistoryList(records): HistoryList) -> Self {
        if records.is_empty() {
            return FormattedString("No calls recorded.".yellow().to_string());
        }

        let mut out = String::new();
        for record in records {
            let _ = writeln!(
                out,
                "{} {} {:>5} {} {}",
                record.id.to_string().dimmed(),
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                status_label(record.status),
                format!("{}ms", record.duration_ms).dimmed(),
                record.method.green()
            );
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<&CallRecord> for FormattedString {
    fn from(record: &CallRecord) -> Self {
        let mut out = format!(
            "{} {} ({}, {}ms)\n",
            record.method.green().bold(),
            status_label(record.status),
            record.timestamp.to_rfc3339(),
            record.duration_ms
        );
        if let Some(endpoint) = &record.endpoint {
            let _ = writeln!(out, "{} {}", "endpoint:".cyan(), endpoint.uri());
        }
        for (key, value) in &record.request_metadata {
            let _ = writeln!(out, "{} {key}: {value}", "header:".cyan());
        }
        let _ = write!(out, "\n{}\n{}\n", "request".cyan(), record.request);
        if let Some(error) = &record.error {
            let _ = write!(out, "\n{}\n{error}", "error".red());
        } else {
            let _ = write!(out, "\n{}\n{}", "response".cyan(), record.response);
        }
        FormattedString(out)
    }
}

impl From<&Workspace> for FormattedString {
    fn from(workspace: &Workspace) -> Self {
        let mut out = format!(
            "{} {}\n",
            "workspace".cyan(),
            workspace.name.green().bold()
        );
        let _ = writeln!(out, "  saved: {}", workspace.saved_at.to_rfc3339());
        if let Some(endpoint) = &workspace.endpoint {
            let _ = writeln!(out, "  endpoint: {}", endpoint.uri());
        }
        if let Some(request) = &workspace.request {
            if let (Some(service), Some(method)) = (&request.service, &request.method) {
                let _ = writeln!(out, "  method: {service}/{method}");
            }
            for (key, value) in &request.metadata {
                let _ = writeln!(out, "  header: {key}: {value}");
            }
            let _ = write!(out, "\n{}", request.body);
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<Descriptor> for FormattedString {
    fn from(descriptor: Descriptor) -> Self {
        match descriptor {
            Descriptor::ServiceDescriptor(service) => service.into(),
            Descriptor::MessageDescriptor(message) => message.into(),
            Descriptor::EnumDescriptor(enum_desc) => enum_desc.into(),
        }
    }
}

impl From<ServiceDescriptor> for FormattedString {
    fn from(service: ServiceDescriptor) -> Self {
        let mut out = format!("{} {} {{\n", "service".cyan(), service.name().green());

        for method in service.methods() {
            out.push_str("  ");
            out.push_str(&FormattedString::from(method).0);
            out.push_str("\n\n");
        }
        out.push('}');
        FormattedString(out)
    }
}

impl From<MethodDescriptor> for FormattedString {
    fn from(method: MethodDescriptor) -> Self {
        let stream = |streaming: bool| {
            if streaming {
                format!("{} ", "stream".cyan())
            } else {
                String::new()
            }
        };

        FormattedString(format!(
            "{} {}({}{}) {} ({}{});",
            "rpc".cyan(),
            method.name().green(),
            stream(method.is_client_streaming()),
            method.input().full_name().yellow(),
            "returns".cyan(),
            stream(method.is_server_streaming()),
            method.output().full_name().yellow()
        ))
    }
}

fn kind_name(kind: &Kind) -> String {
    match kind {
        Kind::Double => "double".into(),
        Kind::Float => "float".into(),
        Kind::Int32 => "int32".into(),
        Kind::Int64 => "int64".into(),
        Kind::Uint32 => "uint32".into(),
        Kind::Uint64 => "uint64".into(),
        Kind::Sint32 => "sint32".into(),
        Kind::Sint64 => "sint64".into(),
        Kind::Fixed32 => "fixed32".into(),
        Kind::Fixed64 => "fixed64".into(),
        Kind::Sfixed32 => "sfixed32".into(),
        Kind::Sfixed64 => "sfixed64".into(),
        Kind::Bool => "bool".into(),
        Kind::String => "string".into(),
        Kind::Bytes => "bytes".into(),
        Kind::Message(m) => m.full_name().into(),
        Kind::Enum(e) => e.full_name().into(),
    }
}

impl From<MessageDescriptor> for FormattedString {
    fn from(message: MessageDescriptor) -> Self {
        let mut out = format!("{} {} {{\n", "message".cyan(), message.name().green());

        for field in message.fields() {
            let type_name = if field.is_map() {
                match field.kind() {
                    Kind::Message(entry) => format!(
                        "map<{}, {}>",
                        kind_name(&entry.map_entry_key_field().kind()),
                        kind_name(&entry.map_entry_value_field().kind())
                    ),
                    other => kind_name(&other),
                }
            } else {
                kind_name(&field.kind())
            };

            let label = if field.is_list() {
                format!("{} ", "repeated".cyan())
            } else if field.containing_oneof().is_some_and(|o| o.is_synthetic()) {
                format!("{} ", "optional".cyan())
            } else {
                String::new()
            };

            let oneof = match field.containing_oneof() {
                Some(oneof) if !oneof.is_synthetic() => {
                    format!(" {}", format!("// oneof {}", oneof.name()).dimmed())
                }
                _ => String::new(),
            };

            let _ = writeln!(
                out,
                "  {label}{} {} = {};{oneof}",
                type_name.yellow(),
                field.name(),
                field.number()
            );
        }
        out.push('}');
        FormattedString(out)
    }
}

impl From<EnumDescriptor> for FormattedString {
    fn from(enum_desc: EnumDescriptor) -> Self {
        let mut out = format!("{} {} {{\n", "enum".cyan(), enum_desc.name().green());

        for val in enum_desc.values() {
            let _ = writeln!(out, "  {} = {};", val.name(), val.number().to_string().purple());
        }
        out.push('}');

        FormattedString(out)
    }
}

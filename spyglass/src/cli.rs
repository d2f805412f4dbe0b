//! # CLI
//!
//! This module defines the command-line interface of `spyglass` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers are `key:value`).
use clap::{Args, Parser, Subcommand};
use spyglass_core::{Endpoint, SecurityProfile};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "spyglass", version, about = "Explore and call gRPC servers through reflection")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Where and how to connect.
#[derive(Args, Clone)]
pub struct Target {
    /// The server address (e.g. localhost:50051 or https://api.example.com:443)
    pub address: String,

    /// Connect over TLS
    #[arg(long)]
    pub tls: bool,

    /// Skip TLS certificate verification (requires --tls)
    #[arg(long)]
    pub insecure: bool,

    /// Dial deadline in milliseconds
    #[arg(long = "connect-timeout", value_name = "MS", value_parser = parse_millis)]
    pub connect_timeout: Option<Duration>,
}

impl Target {
    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        let security = SecurityProfile::from_flags(self.tls, self.insecure)?;
        let endpoint = Endpoint::new(&self.address, security)?;
        Ok(match self.connect_timeout {
            Some(deadline) => endpoint.with_deadline(deadline),
            None => endpoint,
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the services exposed by a server, with their methods
    List {
        #[command(flatten)]
        target: Target,
    },

    /// Describe a service, method, message or enum
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// spyglass describe localhost:50051 helloworld.Greeter
    /// spyglass describe localhost:50051 helloworld.Greeter/SayHello
    /// ```
    Describe {
        #[command(flatten)]
        target: Target,
        /// Fully qualified symbol, or `package.Service/Method`
        symbol: String,
    },

    /// Print an editable JSON template for a message
    Template {
        #[command(flatten)]
        target: Target,
        /// Fully qualified message name (e.g. my.package.Message)
        message: String,
    },

    /// Perform a gRPC call
    ///
    /// Streaming requests take either a single JSON object or an array of objects, one per message.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// spyglass call localhost:50051 helloworld.Greeter/SayHello --body '{"name": "Ada"}'
    /// ```
    Call {
        #[command(flatten)]
        target: Target,

        /// Endpoint (package.Service/Method)
        #[arg(value_parser = parse_method)]
        method: (String, String),

        /// JSON body. Defaults to a template of the input message
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,

        /// Read the JSON body from a file
        #[arg(long)]
        body_file: Option<PathBuf>,

        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Call deadline in milliseconds
        #[arg(long, value_name = "MS", value_parser = parse_millis)]
        deadline: Option<Duration>,

        /// Accept bytes fields that are not base64 as raw text
        #[arg(long)]
        raw_bytes: bool,
    },

    /// Browse the call history
    History {
        #[command(subcommand)]
        sub: HistoryCommands,
    },

    /// Manage saved workspaces
    Workspace {
        #[command(subcommand)]
        sub: WorkspaceCommands,
    },

    /// Show recently used endpoints
    Recent,
}

#[derive(Subcommand)]
pub enum HistoryCommands {
    /// List recorded calls, newest first
    List {
        /// Only calls whose method, request or error contain this text
        #[arg(short, long)]
        query: Option<String>,
        /// Only failed calls
        #[arg(long)]
        failed: bool,
    },
    /// Show one recorded call in full
    Show { id: Uuid },
    /// Call a recorded request again
    Replay { id: Uuid },
    /// Remove one recorded call
    Delete { id: Uuid },
    /// Remove every recorded call
    Clear,
}

#[derive(Subcommand)]
pub enum WorkspaceCommands {
    /// List saved workspaces
    List,
    /// Save a request as a workspace
    Save {
        name: String,
        #[command(flatten)]
        target: Target,
        /// Endpoint (package.Service/Method)
        #[arg(long, value_parser = parse_method)]
        method: Option<(String, String)>,
        #[arg(long)]
        body: Option<String>,
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Replace an existing workspace with the same name
        #[arg(short, long)]
        force: bool,
    },
    /// Show a saved workspace
    Show { name: String },
    /// Send the request saved in a workspace
    Run { name: String },
    /// Delete a saved workspace
    Delete { name: String },
}

fn parse_method(value: &str) -> Result<(String, String), String> {
    let (service, method) = value.split_once('/').ok_or_else(|| {
        format!("Invalid method format: '{value}'. Expected 'package.Service/Method'")
    })?;

    if service.trim().is_empty() || method.trim().is_empty() {
        return Err("Service and Method names cannot be empty".to_string());
    }

    Ok((service.to_string(), method.to_string()))
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| "Format must be 'key:value'".to_string())
}

fn parse_millis(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| format!("Invalid number of milliseconds: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_method_paths() {
        assert_eq!(
            parse_method("helloworld.Greeter/SayHello").unwrap(),
            ("helloworld.Greeter".to_string(), "SayHello".to_string())
        );
        assert!(parse_method("helloworld.Greeter").is_err());
        assert!(parse_method("/SayHello").is_err());
    }

    #[test]
    fn parses_headers() {
        assert_eq!(
            parse_header("x-user: ada").unwrap(),
            ("x-user".to_string(), "ada".to_string())
        );
        assert!(parse_header("x-user").is_err());
    }

    #[test]
    fn insecure_needs_tls() {
        let target = Target {
            address: "localhost:443".into(),
            tls: false,
            insecure: true,
            connect_timeout: None,
        };
        assert!(target.endpoint().is_err());

        let target = Target { tls: true, ..target };
        assert_eq!(
            target.endpoint().unwrap().security(),
            SecurityProfile::TlsSkipVerify
        );
    }

    #[test]
    fn call_arguments() {
        let cli = Cli::try_parse_from([
            "spyglass",
            "call",
            "localhost:50051",
            "helloworld.Greeter/SayHello",
            "--body",
            "{}",
            "-H",
            "x-a:1",
            "-H",
            "x-a:2",
            "--deadline",
            "250",
        ])
        .unwrap();

        let Commands::Call {
            headers, deadline, ..
        } = cli.command
        else {
            panic!("Expected the call command");
        };
        assert_eq!(headers.len(), 2);
        assert_eq!(deadline, Some(Duration::from_millis(250)));
    }
}

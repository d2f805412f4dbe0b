//! # Spyglass CLI Entry Point
//!
//! The main executable for Spyglass. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`], reads the
//!    [`Settings`] from the environment and installs the log subscriber.
//! 2. **Connection**: Opens a [`Session`] and connects it to the requested endpoint.
//! 3. **Execution**: Resolves the schema through reflection and drives the call to completion.
//! 4. **Presentation**: Formats and prints the resulting data or error report.
mod cli;
mod output;

use clap::Parser;
use cli::{Cli, Commands, HistoryCommands, Target, WorkspaceCommands};
use colored::Colorize;
use output::{
    EndpointList, FormattedString, HistoryList, ServiceList, StreamSummary, WorkspaceList,
};
use spyglass_core::codec::{CodecOptions, split_messages};
use spyglass_core::invoker::BufferStats;
use spyglass_core::state::AppState;
use spyglass_core::storage::CallStatus;
use spyglass_core::{
    BidiStream, CallOptions, CallOutcome, Endpoint, ErrorReport, HistoryFilter, ServerStream,
    Session, Settings, StreamEvent,
};
use std::process;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for a finished stream to be recorded before giving up on it.
const RECORD_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            let message = format!("{}\n\n'{err}'", "Configuration Error:".red().bold());
            eprintln!("{}", FormattedString(message));
            process::exit(1);
        }
    };
    init_tracing(settings.debug);

    let session = Session::open(settings).await;
    let cancel = cancel_on_ctrl_c();

    if let Err(err) = run(&session, args.command, &cancel).await {
        eprintln!("{}", render_error(&err));
        process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "spyglass=debug,spyglass_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// A token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted");
            token.cancel();
        }
    });
    cancel
}

fn render_error(err: &anyhow::Error) -> FormattedString {
    match err.downcast_ref::<spyglass_core::Error>() {
        Some(err) => FormattedString::from(&ErrorReport::classify(err)),
        None => FormattedString(format!("{}\n\n'{err:#}'", "Error:".red().bold())),
    }
}

async fn run(session: &Session, command: Commands, cancel: &CancellationToken) -> anyhow::Result<()> {
    match command {
        Commands::List { target } => {
            let services = connect(session, &target, cancel).await?;
            println!("{}", FormattedString::from(ServiceList(services)));
        }
        Commands::Describe { target, symbol } => {
            connect(session, &target, cancel).await?;
            describe(session, &symbol).await?;
        }
        Commands::Template { target, message } => {
            connect(session, &target, cancel).await?;
            let template = session.schema()?.message_template(&message).await?;
            println!("{}", FormattedString::from(template));
        }
        Commands::Call {
            target,
            method: (service, method),
            body,
            body_file,
            headers,
            deadline,
            raw_bytes,
        } => {
            let body = match body_file {
                Some(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to read {}: {e}", path.display())
                })?),
                None => body,
            };

            connect(session, &target, cancel).await?;
            session.select_service(&service).await?;
            if let Some(body) = body {
                session.state().set_request_body(body);
            }
            session.state().set_request_metadata(headers);
            session.select_method(&method).await?;

            let options = CallOptions {
                deadline,
                codec: CodecOptions {
                    allow_raw_bytes: raw_bytes || session.settings().codec.allow_raw_bytes,
                },
            };
            send(session, &options, cancel).await?;
        }
        Commands::History { sub } => history(session, sub, cancel).await?,
        Commands::Workspace { sub } => workspace(session, sub, cancel).await?,
        Commands::Recent => {
            println!("{}", FormattedString::from(EndpointList(session.recents().await)));
        }
    }

    Ok(())
}

async fn connect(
    session: &Session,
    target: &Target,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<spyglass_core::schema::ServiceInfo>> {
    let endpoint = target.endpoint()?;
    Ok(connect_to(session, endpoint, cancel).await?)
}

async fn connect_to(
    session: &Session,
    endpoint: Endpoint,
    cancel: &CancellationToken,
) -> Result<Vec<spyglass_core::schema::ServiceInfo>, spyglass_core::Error> {
    tracing::debug!(%endpoint, "Connecting");
    session.connect(endpoint, cancel).await
}

/// Prints a symbol, or a single method when given `package.Service/Method`.
async fn describe(session: &Session, symbol: &str) -> anyhow::Result<()> {
    let formatted = match symbol.split_once('/') {
        Some((service, method)) => {
            let schema = session.schema()?.resolve_method(service, method).await?;
            FormattedString::from(schema.descriptor)
        }
        None => FormattedString::from(session.describe(symbol).await?),
    };
    println!("{formatted}");
    Ok(())
}

/// Sends the request held in the session state and drives the call to its end.
async fn send(
    session: &Session,
    options: &CallOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let result = match session.send_with(options, cancel).await {
        Ok(outcome) => drive(session, outcome, started).await,
        Err(err) => Err(err.into()),
    };

    session.history().persist().await;
    result
}

async fn drive(session: &Session, outcome: CallOutcome, started: Instant) -> anyhow::Result<()> {
    match outcome {
        CallOutcome::Unary(response) => {
            println!("{}", FormattedString::from(&response));
            Ok(())
        }
        CallOutcome::ServerStream(mut stream) => {
            let result = drain(&mut stream, started).await;
            wait_recorded(session).await;
            result
        }
        CallOutcome::ClientStream(mut call) => {
            for message in split_messages(&session.state().request.get().body)? {
                call.send(&message).await?;
            }
            let response = call.close_and_receive().await?;
            println!("{}", FormattedString::from(&response));
            wait_recorded(session).await;
            Ok(())
        }
        CallOutcome::Bidi(mut stream) => {
            for message in split_messages(&session.state().request.get().body)? {
                stream.send(&message).await?;
            }
            stream.close_send();
            let result = drain(&mut stream, started).await;
            wait_recorded(session).await;
            result
        }
    }
}

/// The receiving half shared by server and bidirectional streams.
trait Responses {
    async fn recv(&mut self) -> StreamEvent;
    fn stats(&self) -> BufferStats;
}

impl Responses for ServerStream {
    async fn recv(&mut self) -> StreamEvent {
        ServerStream::recv(self).await
    }

    fn stats(&self) -> BufferStats {
        ServerStream::stats(self)
    }
}

impl Responses for BidiStream {
    async fn recv(&mut self) -> StreamEvent {
        BidiStream::recv(self).await
    }

    fn stats(&self) -> BufferStats {
        BidiStream::stats(self)
    }
}

/// Prints every message of a response stream, then its summary.
///
/// A stream stopped with Ctrl-C is not an error.
async fn drain(stream: &mut impl Responses, started: Instant) -> anyhow::Result<()> {
    loop {
        match stream.recv().await {
            StreamEvent::Message(message) => println!("{}", FormattedString::from(&message)),
            StreamEvent::End(end) => {
                let error = end.error();
                let summary = StreamSummary(end, stream.stats(), started.elapsed());
                println!("{}", FormattedString::from(summary));
                return match error {
                    Some(spyglass_core::Error::Cancelled) | None => Ok(()),
                    Some(err) => Err(err.into()),
                };
            }
        }
    }
}

/// Waits until the finished streaming call shows up in the history.
async fn wait_recorded(session: &Session) {
    let mut response = session.state().response.subscribe();
    let recorded = tokio::time::timeout(RECORD_GRACE, response.wait_for(|r| !r.loading)).await;
    if recorded.is_err() {
        tracing::warn!("The call finished without being recorded");
    }
}

async fn history(
    session: &Session,
    command: HistoryCommands,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        HistoryCommands::List { query, failed } => {
            let mut filter = HistoryFilter {
                query,
                status: None,
            };
            if failed {
                filter = filter.with_status(CallStatus::Error);
            }
            println!("{}", FormattedString::from(HistoryList(session.history().list(&filter))));
        }
        HistoryCommands::Show { id } => {
            let record = session
                .history()
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("No call recorded with id {id}"))?;
            println!("{}", FormattedString::from(&record));
        }
        HistoryCommands::Replay { id } => {
            let endpoint = session
                .history()
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("No call recorded with id {id}"))?
                .endpoint
                .ok_or_else(|| anyhow::anyhow!("Call {id} was not recorded with an endpoint"))?;

            // Connecting clears the selection, so the request is restored afterwards.
            connect_to(session, endpoint, cancel).await?;
            session.replay(id);
            send(session, &CallOptions::default(), cancel).await?;
        }
        HistoryCommands::Delete { id } => {
            if !session.history().delete(id).await {
                anyhow::bail!("No call recorded with id {id}");
            }
            println!("{}", FormattedString(format!("Deleted {id}")));
        }
        HistoryCommands::Clear => {
            session.history().clear().await;
            println!("{}", FormattedString("History cleared.".to_string()));
        }
    }

    Ok(())
}

async fn workspace(
    session: &Session,
    command: WorkspaceCommands,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        WorkspaceCommands::List => {
            println!("{}", FormattedString::from(WorkspaceList(session.list_workspaces().await?)));
        }
        WorkspaceCommands::Save {
            name,
            target,
            method,
            body,
            headers,
            force,
        } => {
            let state = session.state();
            state.endpoint.set(Some(target.endpoint()?));
            if let Some((service, method)) = method {
                state.selected_service.set(Some(service));
                state.selected_method.set(Some(method));
            }
            state.set_request_body(body.unwrap_or_default());
            state.set_request_metadata(headers);

            let saved = session.save_workspace(&name, force).await?;
            println!("{}", FormattedString::from(&saved));
        }
        WorkspaceCommands::Show { name } => {
            let saved = session.workspaces().load(&name, &AppState::new()).await?;
            println!("{}", FormattedString::from(&saved));
        }
        WorkspaceCommands::Run { name } => {
            let saved = session.workspaces().load(&name, &AppState::new()).await?;
            let endpoint = saved
                .endpoint
                .ok_or_else(|| anyhow::anyhow!("Workspace '{name}' has no endpoint"))?;

            connect_to(session, endpoint, cancel).await?;
            session.load_workspace(&name).await?;
            send(session, &CallOptions::default(), cancel).await?;
        }
        WorkspaceCommands::Delete { name } => {
            session.delete_workspace(&name).await?;
            println!("{}", FormattedString(format!("Deleted workspace '{name}'")));
        }
    }

    Ok(())
}

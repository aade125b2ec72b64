use std::fmt::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use crate::concurrency::ShutdownRx;
use crate::context::MigrationContext;
use crate::error::{ErrorKind, MoltError, MoltResult};
use crate::migrator::render_status;
use crate::workers::base::WorkerHandle;

const THROTTLE_HINT: &str =
    "# Note: you may only throttle for as long as your binary logs are not purged\n";

/// What a command does to the migration context. A static tag per command
/// keeps the registry a plain table; the dispatcher switches on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandAction {
    Help,
    Sup,
    Status,
    Version,
    Coordinates,
    Applier,
    Inspector,
    ChunkSize,
    DmlBatchSize,
    MaxLagMillis,
    ReplicationLagQuery,
    NiceRatio,
    MaxLoad,
    CriticalLoad,
    ThrottleQuery,
    ThrottleHttp,
    ThrottleControlReplicas,
    Throttle,
    NoThrottle,
    Unpostpone,
    Panic,
}

struct ServerCommand {
    name: &'static str,
    aliases: &'static [&'static str],
    value_help: Option<&'static str>,
    help: &'static str,
    action: CommandAction,
}

/// All interactive commands. Kept in registration order; `help` output is
/// sorted by name.
static SERVER_COMMANDS: &[ServerCommand] = &[
    ServerCommand {
        name: "help",
        aliases: &[],
        value_help: None,
        help: "Print this message",
        action: CommandAction::Help,
    },
    ServerCommand {
        name: "sup",
        aliases: &[],
        value_help: None,
        help: "Print a short status message",
        action: CommandAction::Sup,
    },
    ServerCommand {
        name: "status",
        aliases: &["info"],
        value_help: None,
        help: "Print a detailed status message",
        action: CommandAction::Status,
    },
    ServerCommand {
        name: "version",
        aliases: &[],
        value_help: None,
        help: "Print the migrator version",
        action: CommandAction::Version,
    },
    ServerCommand {
        name: "coordinates",
        aliases: &[],
        value_help: None,
        help: "Print the currently inspected coordinates",
        action: CommandAction::Coordinates,
    },
    ServerCommand {
        name: "applier",
        aliases: &[],
        value_help: None,
        help: "Print the hostname of the applier",
        action: CommandAction::Applier,
    },
    ServerCommand {
        name: "inspector",
        aliases: &[],
        value_help: None,
        help: "Print the hostname of the inspector",
        action: CommandAction::Inspector,
    },
    ServerCommand {
        name: "chunk-size",
        aliases: &[],
        value_help: Some("newsize"),
        help: "Set a new chunk-size",
        action: CommandAction::ChunkSize,
    },
    ServerCommand {
        name: "dml-batch-size",
        aliases: &[],
        value_help: Some("newsize"),
        help: "Set a new dml-batch-size",
        action: CommandAction::DmlBatchSize,
    },
    ServerCommand {
        name: "max-lag-millis",
        aliases: &[],
        value_help: Some("max-lag"),
        help: "Set a new replication lag threshold",
        action: CommandAction::MaxLagMillis,
    },
    ServerCommand {
        name: "replication-lag-query",
        aliases: &[],
        value_help: Some("query"),
        help: "(Deprecated) set a new query that determines replication lag without quotes",
        action: CommandAction::ReplicationLagQuery,
    },
    ServerCommand {
        name: "nice-ratio",
        aliases: &[],
        value_help: Some("ratio"),
        help: "Set a new nice-ratio, immediate sleep after each row-copy operation",
        action: CommandAction::NiceRatio,
    },
    ServerCommand {
        name: "max-load",
        aliases: &[],
        value_help: Some("load"),
        help: "Set a new set of max-load thresholds",
        action: CommandAction::MaxLoad,
    },
    ServerCommand {
        name: "critical-load",
        aliases: &[],
        value_help: Some("load"),
        help: "Set a new set of critical-load thresholds",
        action: CommandAction::CriticalLoad,
    },
    ServerCommand {
        name: "throttle-query",
        aliases: &[],
        value_help: Some("query"),
        help: "Set a new throttle-query without quotes",
        action: CommandAction::ThrottleQuery,
    },
    ServerCommand {
        name: "throttle-http",
        aliases: &[],
        value_help: Some("url"),
        help: "Set a new throttle URL",
        action: CommandAction::ThrottleHttp,
    },
    ServerCommand {
        name: "throttle-control-replicas",
        aliases: &[],
        value_help: Some("replicas"),
        help: "Set a new comma delimited list of throttle control replicas",
        action: CommandAction::ThrottleControlReplicas,
    },
    ServerCommand {
        name: "throttle",
        aliases: &["pause", "suspend"],
        value_help: None,
        help: "Force throttle",
        action: CommandAction::Throttle,
    },
    ServerCommand {
        name: "no-throttle",
        aliases: &["unthrottle", "resume", "continue"],
        value_help: None,
        help: "End forced throttling (other throttling may still apply)",
        action: CommandAction::NoThrottle,
    },
    ServerCommand {
        name: "unpostpone",
        aliases: &["no-postpone", "cut-over"],
        value_help: None,
        help: "Bail out a cut-over postpone; proceed to cut-over",
        action: CommandAction::Unpostpone,
    },
    ServerCommand {
        name: "panic",
        aliases: &[],
        value_help: None,
        help: "Panic and quit without cleanup",
        action: CommandAction::Panic,
    },
];

fn find_command(name: &str) -> Option<&'static ServerCommand> {
    SERVER_COMMANDS
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

fn is_arg_question(arg: &str) -> bool {
    arg == "?"
}

/// Applies one command line and renders the response. Errors become the
/// response body too; the protocol has no other error channel.
pub fn apply_server_command(
    context: &MigrationContext,
    app_version: &str,
    line: &str,
) -> String {
    match run_command(context, app_version, line) {
        Ok(response) => response,
        Err(message) => format!("{message}\n"),
    }
}

fn run_command(
    context: &MigrationContext,
    app_version: &str,
    line: &str,
) -> Result<String, String> {
    let mut tokens = line.splitn(2, '=');
    let name = tokens.next().unwrap_or("").trim();
    let arg = tokens.next().map(str::trim).unwrap_or("");
    // Shells sometimes hand us a quoted value.
    let arg = arg.trim_matches('"');

    let command = find_command(name).ok_or_else(|| format!("Unknown command: {name}"))?;

    // Courtesy guard: a mutating command may name the migrated table; a
    // mismatch means the operator is talking to the wrong migration.
    let guard_table_name = |required: bool| -> Result<(), String> {
        if arg.is_empty() {
            if required {
                return Err(format!(
                    "User commanded '{}' without specifying table name, but force-named is set",
                    command.name
                ));
            }
            return Ok(());
        }
        if arg != context.original_table {
            return Err(format!(
                "User commanded '{}' on {}, but migrated table is {}; ignoring request.",
                command.name, arg, context.original_table
            ));
        }
        Ok(())
    };

    match command.action {
        CommandAction::Help => Ok(render_help()),
        CommandAction::Sup | CommandAction::Status => Ok(format!("{}\n", render_status(context))),
        CommandAction::Version => Ok(format!("migrator version: {app_version}\n")),
        CommandAction::Coordinates => {
            let coordinates = context
                .recent_binlog_coordinates()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "N/A".to_string());
            Ok(format!("{coordinates}\n"))
        }
        CommandAction::Applier => Ok(render_server(
            context.config.applier_connection().instance_key().to_string(),
            context.applier_server_info().map(|i| i.version),
        )),
        CommandAction::Inspector => Ok(render_server(
            context.config.inspector.instance_key().to_string(),
            context.inspector_server_info().map(|i| i.version),
        )),
        CommandAction::ChunkSize => {
            if is_arg_question(arg) {
                return Ok(format!("{}\n", context.chunk_size()));
            }
            let size: i64 = arg.parse().map_err(|_| format!("invalid value: {arg}"))?;
            context.set_chunk_size(size);
            Ok(format!("{}\n", render_status(context)))
        }
        CommandAction::DmlBatchSize => {
            if is_arg_question(arg) {
                return Ok(format!("{}\n", context.dml_batch_size()));
            }
            let size: i64 = arg.parse().map_err(|_| format!("invalid value: {arg}"))?;
            context.set_dml_batch_size(size);
            Ok(format!("{}\n", render_status(context)))
        }
        CommandAction::MaxLagMillis => {
            if is_arg_question(arg) {
                return Ok(format!("{}\n", context.max_lag_millis()));
            }
            let millis: i64 = arg.parse().map_err(|_| format!("invalid value: {arg}"))?;
            context.set_max_lag_millis(millis);
            Ok(format!("{}\n", render_status(context)))
        }
        CommandAction::ReplicationLagQuery => Err(
            "replication-lag-query is deprecated. The migrator uses an internal, \
             subsecond resolution query"
                .to_string(),
        ),
        CommandAction::NiceRatio => {
            if is_arg_question(arg) {
                return Ok(format!("{}\n", context.nice_ratio()));
            }
            let ratio: f64 = arg.parse().map_err(|_| format!("invalid value: {arg}"))?;
            context.set_nice_ratio(ratio);
            Ok(format!("{}\n", render_status(context)))
        }
        CommandAction::MaxLoad => {
            if is_arg_question(arg) {
                return Ok(format!("{}\n", context.max_load()));
            }
            context.read_max_load(arg)?;
            Ok(format!("{}\n", render_status(context)))
        }
        CommandAction::CriticalLoad => {
            if is_arg_question(arg) {
                return Ok(format!("{}\n", context.critical_load()));
            }
            context.read_critical_load(arg)?;
            Ok(format!("{}\n", render_status(context)))
        }
        CommandAction::ThrottleQuery => {
            if is_arg_question(arg) {
                return Ok(format!(
                    "{}\n",
                    context.throttle_query().unwrap_or_default()
                ));
            }
            context.set_throttle_query(arg);
            Ok(format!("{THROTTLE_HINT}{}\n", render_status(context)))
        }
        CommandAction::ThrottleHttp => {
            if is_arg_question(arg) {
                return Ok(format!("{}\n", context.throttle_http().unwrap_or_default()));
            }
            context.set_throttle_http(arg);
            Ok(format!("{THROTTLE_HINT}{}\n", render_status(context)))
        }
        CommandAction::ThrottleControlReplicas => {
            if is_arg_question(arg) {
                return Ok(format!(
                    "{}\n",
                    context.throttle_control_replicas().to_comma_delimited_list()
                ));
            }
            context.read_throttle_control_replicas(arg)?;
            Ok(format!(
                "{}\n",
                context.throttle_control_replicas().to_comma_delimited_list()
            ))
        }
        CommandAction::Throttle => {
            guard_table_name(false)?;
            context.set_throttle_commanded_by_user(true);
            Ok(format!("{THROTTLE_HINT}{}\n", render_status(context)))
        }
        CommandAction::NoThrottle => {
            guard_table_name(false)?;
            context.set_throttle_commanded_by_user(false);
            Ok(format!("{}\n", render_status(context)))
        }
        CommandAction::Unpostpone => {
            guard_table_name(context.config.cut_over.force_named_cut_over)?;
            if context.is_postponing_cut_over() {
                context.set_user_commanded_unpostpone();
                Ok("Unpostponed\n".to_string())
            } else {
                Ok(
                    "You may only invoke this when the migration is actively postponing. \
                     At this time it is not.\n"
                        .to_string(),
                )
            }
        }
        CommandAction::Panic => {
            guard_table_name(context.config.cut_over.force_named_panic)?;
            let message = "User commanded 'panic'. The migration will be aborted without \
                           cleanup. Please drop the ghost tables before trying again.";
            context.panic_abort(MoltError::new(ErrorKind::UserPanic));
            Err(message.to_string())
        }
    }
}

fn render_server(key: String, version: Option<String>) -> String {
    format!(
        "Host: {key}, Version: {}\n",
        version.unwrap_or_else(|| "unknown".to_string())
    )
}

fn render_help() -> String {
    let mut commands: Vec<&ServerCommand> = SERVER_COMMANDS.iter().collect();
    commands.sort_by_key(|cmd| cmd.name);

    let mut out = String::new();
    for cmd in commands {
        let mut names = vec![cmd.name];
        let mut aliases = cmd.aliases.to_vec();
        aliases.sort_unstable();
        names.extend(aliases);

        match cmd.value_help {
            Some(value_help) => {
                let _ = writeln!(out, "{}=<{}> # {}", names.join(","), value_help, cmd.help);
            }
            None => {
                let _ = writeln!(out, "{} # {}", names.join(","), cmd.help);
            }
        }
    }
    let _ = writeln!(
        out,
        "- use '?' (question mark) as argument to get info rather than set. \
         e.g. \"max-load=?\" will just print out current max-load."
    );
    out
}

/// Listens for interactive commands on a UNIX socket and/or TCP port.
///
/// Each connection carries exactly one line-terminated command; the
/// response is written back and the connection closed.
pub struct Server {
    context: Arc<MigrationContext>,
    app_version: String,
    shutdown_rx: ShutdownRx,
}

impl Server {
    pub fn new(context: Arc<MigrationContext>, app_version: impl Into<String>, shutdown_rx: ShutdownRx) -> Self {
        Server {
            context,
            app_version: app_version.into(),
            shutdown_rx,
        }
    }

    /// Binds the configured endpoints and serves until shutdown. Returns
    /// immediately when no endpoint is configured.
    pub fn spawn(self) -> MoltResult<Vec<WorkerHandle>> {
        let mut handles = Vec::new();
        let serve = self.context.config.serve.clone();

        #[cfg(unix)]
        if let Some(socket_file) = &serve.socket_file {
            if serve.drop_stale_socket && std::path::Path::new(socket_file).exists() {
                std::fs::remove_file(socket_file)?;
            }
            let listener = std::os::unix::net::UnixListener::bind(socket_file)?;
            listener.set_nonblocking(true)?;
            let listener = UnixListener::from_std(listener)?;
            info!(socket = %socket_file, "command server listening on unix socket");

            let context = self.context.clone();
            let app_version = self.app_version.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            handles.push(WorkerHandle::spawn("command-server-unix", async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                let context = context.clone();
                                let app_version = app_version.clone();
                                tokio::spawn(async move {
                                    if let Err(err) =
                                        handle_connection(stream, &context, &app_version).await
                                    {
                                        warn!(error = %err, "command connection failed");
                                    }
                                });
                            }
                            Err(err) => error!(error = %err, "unix accept failed"),
                        },
                        _ = shutdown_rx.wait_for_shutdown() => return Ok(()),
                    }
                }
            }));
        }

        if let Some(port) = serve.tcp_port {
            let context = self.context.clone();
            let app_version = self.app_version.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            handles.push(WorkerHandle::spawn("command-server-tcp", async move {
                let listener = TcpListener::bind(("0.0.0.0", port)).await?;
                info!(port, "command server listening on tcp");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                let context = context.clone();
                                let app_version = app_version.clone();
                                tokio::spawn(async move {
                                    if let Err(err) =
                                        handle_connection(stream, &context, &app_version).await
                                    {
                                        warn!(error = %err, "command connection failed");
                                    }
                                });
                            }
                            Err(err) => error!(error = %err, "tcp accept failed"),
                        },
                        _ = shutdown_rx.wait_for_shutdown() => return Ok(()),
                    }
                }
            }));
        }

        Ok(handles)
    }
}

async fn handle_connection<S>(
    stream: S,
    context: &MigrationContext,
    app_version: &str,
) -> MoltResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response = apply_server_command(context, app_version, line.trim_end());

    let stream = reader.get_mut();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

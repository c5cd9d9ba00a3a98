//! mdb CLI — launch, attach, and the per-rank wrapper.
//!
//! `launch` starts the exchange server and the MPI job, `attach` connects
//! the interactive shell, and `wrapper` is the internal per-rank entry
//! point written into the appfile by `launch`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use mdb::client::{Client, ClientOpts};
use mdb::launch::{self, LaunchOpts};
use mdb::shell::{MdbShell, ShellOpts};
use mdb::tls;
use mdb::worker::{DebugClient, WorkerOpts};
use tokio_rustls::TlsConnector;

#[derive(Parser)]
#[command(name = "mdb", version, about = "A parallel debugger multiplexer for MPI programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the mdb exchange server and the MPI job.
    Launch(LaunchArgs),
    /// Attach an interactive debugging shell to a running exchange server.
    Attach(AttachArgs),
    /// Internal: per-rank debugger wrapper, invoked via the appfile.
    Wrapper(WrapperArgs),
}

#[derive(Args)]
struct LaunchArgs {
    /// Total number of ranks to debug.
    #[arg(short = 'n', long, default_value_t = 1)]
    ranks: u32,

    /// Rank(s) to debug e.g., 0,3-5 will debug ranks 0,3,4 and 5.
    /// If empty all ranks will be selected.
    #[arg(short = 's', long)]
    select: Option<String>,

    /// Hostname the exchange server binds.
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// MPI launcher e.g., mpirun, mpiexec, srun etc.
    #[arg(long, default_value = "mpirun")]
    mpi_command: String,

    /// Appfile flag override for the MPI launcher (e.g. configfile).
    #[arg(long)]
    mpi_config_opt: Option<String>,

    /// Exchange server port.
    #[arg(short = 'p', long, default_value_t = 2000)]
    port: u16,

    /// Debug backend e.g., gdb, lldb etc.
    #[arg(short = 'b', long, default_value = "gdb")]
    backend: String,

    /// Target binary to debug.
    #[arg(short = 't', long)]
    target: String,

    /// Redirect stdout from the target binary to this path.
    #[arg(long)]
    redirect_stdout: Option<String>,

    /// Maximum number of failed worker connection attempts (one per second).
    #[arg(long, default_value_t = 10)]
    connection_attempts: u32,

    /// Minimum level of log messages.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Arguments passed to the target binary (after `--`).
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Args)]
struct AttachArgs {
    /// Hostname where the exchange server is running.
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Exchange server port.
    #[arg(short = 'p', long, default_value_t = 2000)]
    port: u16,

    /// Initial rank selection (defaults to everything debuggable).
    #[arg(short = 's', long)]
    select: Option<String>,

    /// Execute a set of mdb commands contained in a script file before
    /// entering the shell.
    #[arg(short = 'x', long)]
    exec_script: Option<PathBuf>,

    /// Whether to spawn the interactive shell (use with -x).
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    interactive: bool,

    /// Minimum level of log messages.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Log destination: a path, or the special values `stderr`/`stdout`.
    #[arg(long, default_value = "mdb-attach.log")]
    log_file: String,

    /// Maximum number of failed connection attempts (one per second).
    #[arg(long, default_value_t = 3)]
    connection_attempts: u32,
}

// Internal command: -h is the exchange hostname here (matching the appfile
// format), so the auto help flag is disabled.
#[derive(Args)]
#[command(disable_help_flag = true)]
struct WrapperArgs {
    /// Rank of this debug process.
    #[arg(short = 'm', long)]
    my_rank: u32,

    /// Hostname where the exchange server is running.
    #[arg(short = 'h', long, default_value = "localhost")]
    exchange_hostname: String,

    /// Exchange server port.
    #[arg(short = 'p', long)]
    exchange_port: u16,

    /// Debug backend e.g., gdb, lldb etc.
    #[arg(short = 'b', long)]
    backend: String,

    /// Target binary to debug.
    #[arg(short = 't', long)]
    target: String,

    /// Redirect stdout from the target binary to this path.
    #[arg(long)]
    redirect_stdout: Option<String>,

    /// Maximum number of failed connection attempts (one per second).
    #[arg(long, default_value_t = 10)]
    connection_attempts: u32,

    /// Minimum level of log messages.
    #[arg(long, default_value = "debug")]
    log_level: String,

    /// Arguments passed to the target binary (after `--`).
    #[arg(last = true)]
    args: Vec<String>,
}

enum LogTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

fn init_logging(level: &str, target: LogTarget) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(level);
    match target {
        LogTarget::Stderr => {
            builder.target(env_logger::Target::Stderr);
        }
        LogTarget::Stdout => {
            builder.target(env_logger::Target::Stdout);
        }
        LogTarget::File(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("create log file {}", path.display()))?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    builder.format_timestamp_secs();
    builder.try_init().context("initialize logging")?;
    Ok(())
}

/// Each component runs one single-threaded cooperative event loop.
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn client_tls() -> Result<Option<TlsConnector>> {
    if tls::tls_enabled() {
        Ok(Some(tls::client_connector()?))
    } else {
        Ok(None)
    }
}

fn run_launch(args: LaunchArgs) -> Result<()> {
    init_logging(&args.log_level, LogTarget::Stderr)?;

    // Debug all ranks if no selection was given.
    let select = args
        .select
        .unwrap_or_else(|| format!("0-{}", args.ranks.saturating_sub(1)));

    let opts = LaunchOpts {
        ranks: args.ranks,
        select,
        hostname: args.hostname,
        port: args.port,
        backend: args.backend,
        target: args.target,
        args: args.args,
        redirect_stdout: args.redirect_stdout,
        connection_attempts: args.connection_attempts,
        mpi_command: args.mpi_command,
        mpi_config_opt: args.mpi_config_opt,
        appfile: PathBuf::from(".mdb.appfile"),
    };
    runtime()?.block_on(launch::run(opts))
}

fn run_attach(args: AttachArgs) -> Result<()> {
    let target = match args.log_file.as_str() {
        "stderr" => LogTarget::Stderr,
        "stdout" => LogTarget::Stdout,
        path => LogTarget::File(PathBuf::from(path)),
    };
    init_logging(&args.log_level, target)?;

    runtime()?.block_on(async {
        let client = Client::connect(ClientOpts {
            hostname: args.hostname,
            port: args.port,
            connection_attempts: args.connection_attempts,
            tls: client_tls()?,
        })
        .await?;
        log::info!(
            "attached: {} ranks, backend [{}], select [{}]",
            client.number_of_ranks,
            client.backend_name,
            client.select_str
        );

        let mut shell = MdbShell::new(client, args.select)?;
        shell
            .run(&ShellOpts {
                exec_script: args.exec_script,
                interactive: args.interactive,
            })
            .await
    })
}

fn run_wrapper(args: WrapperArgs) -> Result<()> {
    init_logging(
        &args.log_level,
        LogTarget::File(PathBuf::from(format!("rank.{}.log", args.my_rank))),
    )?;

    runtime()?.block_on(async {
        let worker = DebugClient::new(WorkerOpts {
            hostname: args.exchange_hostname,
            port: args.exchange_port,
            rank: args.my_rank,
            backend_name: args.backend,
            target: args.target,
            args: args.args,
            redirect_stdout: args.redirect_stdout,
            connection_attempts: args.connection_attempts,
            tls: client_tls()?,
        })?;
        worker.run().await
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Launch(args) => run_launch(args),
        Commands::Attach(args) => run_attach(args),
        Commands::Wrapper(args) => run_wrapper(args),
    }
}

//! Launch-side plumbing: appfile generation, MPI flavour detection, and
//! the `mdb launch` orchestration (certificate bootstrap, launcher spawn,
//! exchange event loop).
//!
//! The appfile hands one line per rank to `mpirun`/equivalent. Selected
//! ranks are started under `mdb wrapper`, which owns the debugger and
//! reports to the exchange; unselected ranks run the target directly:
//!
//! ```text
//! -n 1 <mdb> wrapper -m 0 -h host -p 2000 -b gdb -t ./app --connection-attempts 10 -- <args>
//! -n 1 ./app <args>
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::exchange::{ExchangeOpts, ExchangeServer, DEBUGGER_TIMEOUT};
use crate::tls;
use crate::utils::parse_ranks;

/// Supported MPI launcher families, detected from `mpirun --version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpiMode {
    /// No known launcher detected.
    Unsupported,
    /// Intel MPI (`--configfile`).
    Intel,
    /// Open MPI (`--app`).
    OpenMpi,
    /// MPICH / Hydra (`--pmi-port --configfile`).
    Mpich,
}

/// Classify an `mpirun --version` banner.
pub fn detect_mpi_mode(version_output: &str) -> MpiMode {
    let banner = version_output.to_lowercase();
    if banner.contains("intel") {
        MpiMode::Intel
    } else if banner.contains("open mpi") {
        MpiMode::OpenMpi
    } else if banner.contains("hydra") {
        MpiMode::Mpich
    } else {
        MpiMode::Unsupported
    }
}

/// Run `mpirun --version` and classify the result.
///
/// A missing `mpirun` is reported as [`MpiMode::Unsupported`] rather than
/// an error — a `--mpi-config-opt` override may still make the launch
/// viable.
pub async fn probe_mpi_mode() -> MpiMode {
    match tokio::process::Command::new("mpirun")
        .arg("--version")
        .output()
        .await
    {
        Ok(output) => detect_mpi_mode(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            log::warn!("could not probe mpirun: {e}");
            MpiMode::Unsupported
        }
    }
}

/// Everything `mdb launch` needs to know.
pub struct LaunchOpts {
    /// Total rank count.
    pub ranks: u32,
    /// Rank selection string (already defaulted to `0-{ranks-1}`).
    pub select: String,
    /// Hostname the exchange binds and workers dial.
    pub hostname: String,
    /// Exchange port.
    pub port: u16,
    /// Backend name handed to every wrapper.
    pub backend: String,
    /// Target binary to debug.
    pub target: String,
    /// Arguments forwarded to the target.
    pub args: Vec<String>,
    /// Optional stdout redirection path for the inferior.
    pub redirect_stdout: Option<String>,
    /// Connection attempt budget handed to every wrapper.
    pub connection_attempts: u32,
    /// MPI launcher executable.
    pub mpi_command: String,
    /// Appfile flag override (e.g. `configfile`), bypassing detection.
    pub mpi_config_opt: Option<String>,
    /// Where the appfile is written.
    pub appfile: PathBuf,
}

/// Generates the appfile and the launcher command line.
pub struct WrapperLauncher {
    opts: LaunchOpts,
    select: Vec<u32>,
    mpi_mode: MpiMode,
}

impl WrapperLauncher {
    /// Build a launcher, parsing and validating the rank selection.
    ///
    /// # Errors
    ///
    /// Returns an error if the selection does not parse or names a rank
    /// outside the job.
    pub fn new(opts: LaunchOpts, mpi_mode: MpiMode) -> Result<Self> {
        let select = parse_ranks(&opts.select)?;
        if let Some(rank) = select.iter().find(|r| **r >= opts.ranks) {
            bail!(
                "selected rank {rank} is outside the job (ranks 0-{})",
                opts.ranks - 1
            );
        }
        Ok(Self {
            opts,
            select,
            mpi_mode,
        })
    }

    /// Render the appfile: one line per rank, wrapper invocation for
    /// selected ranks, bare target otherwise.
    pub fn appfile_contents(&self, wrapper_exe: &str) -> String {
        let opts = &self.opts;
        let args = opts.args.join(" ");
        let mut lines = Vec::with_capacity(opts.ranks as usize);
        for rank in 0..opts.ranks {
            if self.select.contains(&rank) {
                let mut line = format!(
                    "-n 1 {} wrapper -m {} -h {} -p {} -b {} -t {} --connection-attempts {}",
                    wrapper_exe,
                    rank,
                    opts.hostname,
                    opts.port,
                    opts.backend,
                    opts.target,
                    opts.connection_attempts,
                );
                if let Some(path) = &opts.redirect_stdout {
                    line.push_str(&format!(" --redirect-stdout {path}"));
                }
                line.push_str(&format!(" -- {args}"));
                lines.push(line);
            } else {
                lines.push(format!("-n 1 {} {}", opts.target, args));
            }
        }
        lines.join("\n")
    }

    /// Write the appfile next to the working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_app_file(&self) -> Result<()> {
        let wrapper_exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "mdb".to_owned());
        std::fs::write(&self.opts.appfile, self.appfile_contents(&wrapper_exe))
            .with_context(|| format!("write appfile {}", self.opts.appfile.display()))?;
        Ok(())
    }

    /// Assemble the launcher argv for the detected MPI flavour.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported launcher without a
    /// `--mpi-config-opt` override.
    pub fn launch_command(&self) -> Result<Vec<String>> {
        let appfile = self.opts.appfile.display().to_string();
        let launcher = self.opts.mpi_command.clone();
        if let Some(opt) = &self.opts.mpi_config_opt {
            return Ok(vec![launcher, format!("--{opt}"), appfile]);
        }
        let flags: &[&str] = match self.mpi_mode {
            MpiMode::Intel => &["--configfile"],
            MpiMode::OpenMpi => &["--app"],
            MpiMode::Mpich => &["--pmi-port", "--configfile"],
            MpiMode::Unsupported => bail!(
                "MPI mode not supported. Try specifying the --mpi-config-opt option."
            ),
        };
        let mut cmd = vec![launcher];
        cmd.extend(flags.iter().map(|f| (*f).to_owned()));
        cmd.push(appfile);
        Ok(cmd)
    }
}

/// The `mdb launch` subcommand: bootstrap certificates, write the appfile,
/// spawn the MPI launcher, and run the exchange until shutdown.
///
/// # Errors
///
/// Returns an error on any fatal startup failure (certificate material,
/// unsupported MPI, launcher spawn, bind).
pub async fn run(opts: LaunchOpts) -> Result<()> {
    let tls_acceptor = if tls::tls_enabled() {
        tls::ensure_certificate(&opts.hostname)?;
        Some(tls::server_acceptor()?)
    } else {
        None
    };

    let exchange = ExchangeServer::new(ExchangeOpts {
        hostname: opts.hostname.clone(),
        port: opts.port,
        number_of_ranks: opts.ranks,
        backend_name: opts.backend.clone(),
        select: opts.select.clone(),
        debugger_timeout: DEBUGGER_TIMEOUT,
        tls: tls_acceptor,
    })?;

    let mpi_mode = probe_mpi_mode().await;
    let launcher = WrapperLauncher::new(opts, mpi_mode)?;
    launcher.write_app_file()?;
    let cmd = launcher.launch_command()?;
    log::debug!("launch command: [{}]", cmd.join(" "));

    // Bind before spawning the job so the workers' first connection
    // attempts usually land; retries cover the rest of the race.
    let listener = exchange.bind().await?;

    let child = tokio::process::Command::new(&cmd[0])
        .args(&cmd[1..])
        .spawn()
        .with_context(|| format!("spawn mpi launcher [{}]", cmd.join(" ")))?;
    exchange.set_launch_task(child);
    exchange.spawn_signal_handler()?;
    exchange.spawn_launch_monitor();

    exchange.serve(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> LaunchOpts {
        LaunchOpts {
            ranks: 4,
            select: "0,2".to_owned(),
            hostname: "localhost".to_owned(),
            port: 2000,
            backend: "gdb".to_owned(),
            target: "./a.out".to_owned(),
            args: vec!["--flag".to_owned(), "value".to_owned()],
            redirect_stdout: None,
            connection_attempts: 10,
            mpi_command: "mpirun".to_owned(),
            mpi_config_opt: None,
            appfile: PathBuf::from(".mdb.appfile"),
        }
    }

    #[test]
    fn test_detect_mpi_mode_variants() {
        assert_eq!(detect_mpi_mode("mpirun (Open MPI) 4.1.2"), MpiMode::OpenMpi);
        assert_eq!(
            detect_mpi_mode("Intel(R) MPI Library for Linux"),
            MpiMode::Intel
        );
        assert_eq!(detect_mpi_mode("HYDRA build details:"), MpiMode::Mpich);
        assert_eq!(detect_mpi_mode("slurm-something"), MpiMode::Unsupported);
    }

    #[test]
    fn test_appfile_selected_and_plain_lines() {
        let launcher = WrapperLauncher::new(opts(), MpiMode::OpenMpi).unwrap();
        let contents = launcher.appfile_contents("/usr/bin/mdb");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "-n 1 /usr/bin/mdb wrapper -m 0 -h localhost -p 2000 -b gdb -t ./a.out \
             --connection-attempts 10 -- --flag value"
        );
        assert_eq!(lines[1], "-n 1 ./a.out --flag value");
        assert!(lines[2].contains("wrapper -m 2"));
        assert_eq!(lines[3], "-n 1 ./a.out --flag value");
    }

    #[test]
    fn test_appfile_redirect_stdout_flag() {
        let mut o = opts();
        o.redirect_stdout = Some("out.log".to_owned());
        let launcher = WrapperLauncher::new(o, MpiMode::OpenMpi).unwrap();
        let contents = launcher.appfile_contents("mdb");
        assert!(contents.contains("--redirect-stdout out.log --"));
    }

    #[test]
    fn test_launch_command_per_flavour() {
        let open = WrapperLauncher::new(opts(), MpiMode::OpenMpi).unwrap();
        assert_eq!(
            open.launch_command().unwrap(),
            vec!["mpirun", "--app", ".mdb.appfile"]
        );

        let intel = WrapperLauncher::new(opts(), MpiMode::Intel).unwrap();
        assert_eq!(
            intel.launch_command().unwrap(),
            vec!["mpirun", "--configfile", ".mdb.appfile"]
        );

        let mpich = WrapperLauncher::new(opts(), MpiMode::Mpich).unwrap();
        assert_eq!(
            mpich.launch_command().unwrap(),
            vec!["mpirun", "--pmi-port", "--configfile", ".mdb.appfile"]
        );
    }

    #[test]
    fn test_config_opt_overrides_detection() {
        let mut o = opts();
        o.mpi_config_opt = Some("configfile".to_owned());
        let launcher = WrapperLauncher::new(o, MpiMode::Unsupported).unwrap();
        assert_eq!(
            launcher.launch_command().unwrap(),
            vec!["mpirun", "--configfile", ".mdb.appfile"]
        );
    }

    #[test]
    fn test_unsupported_without_override_fails() {
        let launcher = WrapperLauncher::new(opts(), MpiMode::Unsupported).unwrap();
        assert!(launcher.launch_command().is_err());
    }

    #[test]
    fn test_select_outside_job_is_rejected() {
        let mut o = opts();
        o.select = "0,4".to_owned();
        assert!(WrapperLauncher::new(o, MpiMode::OpenMpi).is_err());
    }
}

//! CephFS client CLI - event entry point for the unit agent.
//!
//! The host framework runs this binary once per lifecycle event. Each run
//! reads the share relation data and the unit configuration, reconciles the
//! host mount, publishes the unit record and prints the resulting status.

use std::path::PathBuf;

use cephfs_client_core::peer::default_peer_dir;
use cephfs_client_core::probe::PROC_MOUNTS;
use cephfs_client_core::{
    ConnectionFactStore, ExecutionContext, FilePeerStore, MountProbe, MountTable, PeerCoordinator,
    PolicyStore, PrivilegeEscalation, Reconciler, SystemMounter, UnitStatus, packages,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// CephFS client unit agent.
#[derive(Parser)]
#[command(name = "cephfs-client")]
#[command(about = "Mounts a CephFS share according to relation data and unit config", long_about = None)]
struct Cli {
    /// Unit identifier, used as the key of this unit's peer record.
    #[arg(long, env = "CEPHFS_CLIENT_UNIT", default_value = "cephfs-client/0", global = true)]
    unit: String,

    /// JSON file with the share relation data. A missing file means no remote unit.
    #[arg(long, global = true)]
    relation: Option<PathBuf>,

    /// JSON file with the unit configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the peer records.
    #[arg(long, env = "CEPHFS_CLIENT_PEER_DIR", global = true)]
    peer_dir: Option<PathBuf>,

    /// Directory for the short-lived cephx secret files passed to mount.ceph.
    #[arg(long, env = "CEPHFS_CLIENT_SECRET_DIR", global = true)]
    secret_dir: Option<PathBuf>,

    /// Mount table to probe.
    #[arg(long, default_value = PROC_MOUNTS, global = true)]
    mount_table: PathBuf,

    /// How to gain root for mount commands. Defaults to direct when running
    /// as root and sudo otherwise.
    #[arg(long, value_enum, global = true)]
    escalation: Option<Escalation>,

    /// Print the full report as JSON instead of the status line.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the host mount with the current inputs.
    Reconcile,
    /// Unmount the managed share and clean up the host.
    Stop {
        /// Keep the helper packages even when no CephFS mount remains.
        #[arg(long)]
        keep_packages: bool,
    },
    /// Print the current status without changing anything.
    Status,
    /// Install the helper packages.
    Install,
    /// Remove the helper packages unless CephFS mounts remain.
    Remove,
}

#[derive(Clone, Copy, ValueEnum)]
enum Escalation {
    None,
    Sudo,
    Pkexec,
}

impl From<Escalation> for PrivilegeEscalation {
    fn from(value: Escalation) -> Self {
        match value {
            Escalation::None => PrivilegeEscalation::None,
            Escalation::Sudo => PrivilegeEscalation::Sudo,
            Escalation::Pkexec => PrivilegeEscalation::Pkexec,
        }
    }
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"))]
    Core { source: cephfs_client_core::Error },

    #[snafu(display("failed to encode report: {source}"))]
    Output { source: serde_json::Error },
}

type Result<T> = std::result::Result<T, CliError>;

#[derive(Serialize)]
struct PackageReport {
    action: &'static str,
    packages: &'static [&'static str],
    skipped: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let ctx = match cli.escalation {
        Some(escalation) => ExecutionContext::with_escalation(escalation.into()),
        None => ExecutionContext::auto(),
    };

    match &cli.command {
        Commands::Reconcile => {
            let facts = load_facts(cli)?;
            let policy = load_policy(cli)?;
            let report = reconciler(cli, ctx).reconcile(&facts, &policy);
            print_report(cli, &report, &report.status)
        }
        Commands::Stop { keep_packages } => {
            let policy = load_policy(cli)?;
            let teardown = reconciler(cli, ctx.clone()).teardown(&policy);
            if teardown.helpers_removable && !keep_packages {
                packages::remove(&ctx).context(CoreSnafu)?;
            } else if !teardown.helpers_removable {
                info!("CephFS mounts remain on host; keeping helper packages");
            }
            print_report(cli, &teardown, &teardown.report.status)
        }
        Commands::Status => {
            let facts = load_facts(cli)?;
            let policy = load_policy(cli)?;
            let status = reconciler(cli, ctx).status(&facts, &policy);
            print_report(cli, &status, &status)
        }
        Commands::Install => {
            packages::install(&ctx).context(CoreSnafu)?;
            let report = PackageReport {
                action: "install",
                packages: &packages::HELPER_PACKAGES,
                skipped: false,
            };
            print_line(cli, &report, "Installed helper packages")
        }
        Commands::Remove => {
            let remaining = MountTable::with_path(&cli.mount_table)
                .ceph_mounts()
                .context(CoreSnafu)?;
            let skipped = !remaining.is_empty();
            if skipped {
                warn!(remaining = remaining.len(), "CephFS mounts remain; not removing helper packages");
            } else {
                packages::remove(&ctx).context(CoreSnafu)?;
            }
            let report = PackageReport {
                action: "remove",
                packages: &packages::HELPER_PACKAGES,
                skipped,
            };
            let line = if skipped {
                "Kept helper packages: CephFS mounts remain"
            } else {
                "Removed helper packages"
            };
            print_line(cli, &report, line)
        }
    }
}

fn reconciler(
    cli: &Cli,
    ctx: ExecutionContext,
) -> Reconciler<MountTable, SystemMounter, FilePeerStore> {
    let peer_dir = cli.peer_dir.clone().unwrap_or_else(default_peer_dir);
    let mut mounter = SystemMounter::new(ctx);
    if let Some(dir) = &cli.secret_dir {
        mounter = mounter.with_secret_dir(dir);
    }
    Reconciler::new(
        MountTable::with_path(&cli.mount_table),
        mounter,
        PeerCoordinator::new(cli.unit.as_str(), FilePeerStore::new(peer_dir)),
    )
}

fn load_facts(cli: &Cli) -> Result<ConnectionFactStore> {
    match &cli.relation {
        Some(path) => ConnectionFactStore::from_path(path).context(CoreSnafu),
        None => Ok(ConnectionFactStore::departed()),
    }
}

fn load_policy(cli: &Cli) -> Result<PolicyStore> {
    match &cli.config {
        Some(path) => PolicyStore::from_path(path).context(CoreSnafu),
        None => Ok(PolicyStore::unset()),
    }
}

fn print_report<T: Serialize>(cli: &Cli, report: &T, status: &UnitStatus) -> Result<()> {
    print_line(cli, report, &status.to_string())
}

fn print_line<T: Serialize>(cli: &Cli, report: &T, line: &str) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(report).context(OutputSnafu)?);
    } else {
        println!("{}", line);
    }
    Ok(())
}

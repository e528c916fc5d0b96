//! Command-line surface of `edgectl`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "edgectl", about = "Edge-node operational agent", version)]
pub struct Cli {
    /// Log filter, e.g. `info` or `mefedge_certmgr=debug`.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Install root of the node.
    #[arg(long, default_value = "/opt/mef", global = true)]
    pub install_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UpgradeMode {
    /// Verify and unpack the package into the staging slot.
    Upgrade,
    /// Flip to the staged slot and migrate config.
    Effect,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// First-time installation from an unpacked package directory.
    Install {
        #[arg(long)]
        pkg_dir: PathBuf,
        /// Accept a tmpfs-backed install root.
        #[arg(long)]
        allow_tmpfs: bool,
    },

    /// Stage or apply an upgrade package.
    Upgrade {
        #[arg(long)]
        pkg_dir: Option<PathBuf>,
        #[arg(long, default_value = "/var/log/mef")]
        log_dir: PathBuf,
        #[arg(long, default_value = "/var/log/mef-backup")]
        log_backup_dir: PathBuf,
        /// Config retention policy; only `all` is supported.
        #[arg(long, default_value = "all")]
        keep_config: String,
        #[arg(long, value_enum)]
        mode: UpgradeMode,
    },

    /// Bring the node back to a consistent idle state.
    Recovery,

    /// Factory reset: drop trust material, model files and the cloud
    /// binding, keeping the installed software.
    Reset,

    /// Move root CAs in or out of the node, one `.crt` per name.
    ExchangeCerts {
        #[arg(long, conflicts_with = "export")]
        import: Option<PathBuf>,
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Hand the edge-core TLS key over its named pipe and exit.
    PrepareEdgecore,

    /// Repair log directory ownership, modes and oversized files.
    RecoverLog {
        #[arg(long, default_value = "/var/log/mef")]
        log_dir: PathBuf,
    },

    /// Show or change the net-manager configuration. With no flags
    /// the current configuration is printed.
    NetConfig {
        /// `FD` or `MEF`.
        #[arg(long)]
        net_type: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        with_om: Option<bool>,
        #[arg(long)]
        token: Option<String>,
        /// Base64 PEM of the cloud root CA (MEF mode).
        #[arg(long)]
        cloud_ca: Option<String>,
    },

    /// Run the message router and certificate monitor.
    Daemon,
}

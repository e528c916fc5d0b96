mod cli;
mod commands;
mod daemon;

use clap::Parser;

use cli::{Cli, Command, UpgradeMode};
use mefedge_common::paths::PathLayout;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let layout = PathLayout::new(&cli.install_dir);

    match cli.command {
        Command::Install {
            pkg_dir,
            allow_tmpfs,
        } => commands::install(&layout, pkg_dir, allow_tmpfs),
        Command::Upgrade {
            pkg_dir,
            log_dir,
            log_backup_dir,
            keep_config,
            mode,
        } => {
            if keep_config != "all" {
                anyhow::bail!("unsupported --keep-config value: {keep_config}");
            }
            match mode {
                UpgradeMode::Upgrade => {
                    let pkg_dir = pkg_dir
                        .ok_or_else(|| anyhow::anyhow!("--pkg-dir is required for staging"))?;
                    commands::upgrade_prepare(&layout, pkg_dir, log_dir, log_backup_dir)
                }
                UpgradeMode::Effect => commands::upgrade_effect(&layout, log_dir, log_backup_dir),
            }
        }
        Command::Recovery => commands::recovery(&layout),
        Command::Reset => commands::reset(&layout),
        Command::ExchangeCerts { import, export } => {
            commands::exchange_certs(&layout, import, export)
        }
        Command::PrepareEdgecore => commands::prepare_edgecore(&layout),
        Command::RecoverLog { log_dir } => commands::recover_log(&log_dir),
        Command::NetConfig {
            net_type,
            ip,
            port,
            with_om,
            token,
            cloud_ca,
        } => commands::net_config(&layout, net_type, ip, port, with_om, token, cloud_ca),
        Command::Daemon => daemon::run(layout).await,
    }
}

#[cfg(test)]
mod tests {
    use super::cli::{Cli, Command, UpgradeMode};
    use clap::Parser;

    #[test]
    fn install_args_parse() {
        let cli = Cli::parse_from([
            "edgectl",
            "--install-dir",
            "/opt/mef",
            "install",
            "--pkg-dir",
            "/tmp/pkg",
            "--allow-tmpfs",
        ]);
        match cli.command {
            Command::Install {
                pkg_dir,
                allow_tmpfs,
            } => {
                assert_eq!(pkg_dir, std::path::PathBuf::from("/tmp/pkg"));
                assert!(allow_tmpfs);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn upgrade_mode_is_required() {
        assert!(Cli::try_parse_from(["edgectl", "upgrade"]).is_err());
        let cli = Cli::parse_from(["edgectl", "upgrade", "--mode", "effect"]);
        match cli.command {
            Command::Upgrade { mode, pkg_dir, .. } => {
                assert_eq!(mode, UpgradeMode::Effect);
                assert!(pkg_dir.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn exchange_certs_flags_conflict() {
        assert!(Cli::try_parse_from([
            "edgectl",
            "exchange-certs",
            "--import",
            "/a",
            "--export",
            "/b",
        ])
        .is_err());
    }
}

use std::process::exit;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use log::warn;

use port_filter::{
    Stage,
    config::{CgroupArgs, CgroupOptions, XdpArgs, XdpOptions},
    error::StageExt,
    lifecycle,
    shutdown::{Shutdown, listen_for_signals},
    supervisor::DrainReport,
};

#[derive(Parser)]
#[command(name = "port-filter")]
#[command(about = "Attach port-policy eBPF filters and keep them alive until interrupted", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Allow a single TCP port for processes in a cgroup (connect4 + bind4)
    Cgroup(CgroupArgs),
    /// Drop TCP traffic on a port at an interface's XDP ingress hook
    Xdp(XdpArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("port-filter error: {err:?}");
            exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let (trigger, shutdown) = Shutdown::channel();

    let report = match cli.command {
        Some(Commands::Cgroup(args)) => {
            let opts = CgroupOptions::try_from(args).stage(Stage::Config)?;
            listen_for_signals(trigger).context("failed to install signal handlers")?;
            lifecycle::run_cgroup(opts, shutdown).await?
        }
        Some(Commands::Xdp(args)) => {
            let opts = XdpOptions::try_from(args).stage(Stage::Config)?;
            listen_for_signals(trigger).context("failed to install signal handlers")?;
            lifecycle::run_xdp(opts, shutdown).await?
        }
        None => {
            Cli::command().print_help().ok();
            println!();
            return Ok(0);
        }
    };

    Ok(shutdown_exit_code(&report))
}

/// Release failures while draining are logged, never fatal.
fn shutdown_exit_code(report: &DrainReport) -> i32 {
    if !report.is_clean() {
        warn!(
            "{} release(s) failed during shutdown, exiting normally",
            report.failures.len()
        );
    }
    0
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use port_filter::{
        FilterError,
        attach::{CgroupMode, XdpMode},
    };
    use port_filter_common::{DEFAULT_PORT, cgroup, xdp};

    use super::*;

    #[test]
    fn cgroup_requires_a_path() {
        let err = Cli::try_parse_from(["port-filter", "cgroup"]).err().unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn cgroup_defaults_follow_the_shipped_object() {
        let cli =
            Cli::try_parse_from(["port-filter", "cgroup", "--cgroup", "/sys/fs/cgroup/demo"])
                .unwrap();
        let Some(Commands::Cgroup(args)) = cli.command else {
            panic!("expected cgroup subcommand");
        };
        assert_eq!(args.port, DEFAULT_PORT as i64);
        assert_eq!(args.obj, PathBuf::from(cgroup::DEFAULT_OBJECT));
        assert_eq!(args.map, cgroup::POLICY_MAP);
        assert_eq!(args.connect_program, cgroup::CONNECT_PROGRAM);
        assert_eq!(args.bind_program, cgroup::BIND_PROGRAM);
        assert_eq!(args.attach_mode, CgroupMode::Single);
    }

    #[test]
    fn xdp_flags_parse() {
        let cli = Cli::try_parse_from([
            "port-filter",
            "xdp",
            "--iface",
            "lo",
            "--port",
            "8443",
            "--xdp-mode",
            "driver",
        ])
        .unwrap();
        let Some(Commands::Xdp(args)) = cli.command else {
            panic!("expected xdp subcommand");
        };
        assert_eq!(args.iface, "lo");
        assert_eq!(args.port, 8443);
        assert_eq!(args.map, xdp::POLICY_MAP);
        assert_eq!(args.xdp_mode, XdpMode::Driver);
    }

    #[test]
    fn xdp_mode_defaults_to_kernel_choice() {
        let cli = Cli::try_parse_from(["port-filter", "xdp"]).unwrap();
        let Some(Commands::Xdp(args)) = cli.command else {
            panic!("expected xdp subcommand");
        };
        assert_eq!(args.xdp_mode, XdpMode::Auto);
        assert_eq!(args.iface, xdp::DEFAULT_IFACE);
    }

    #[test]
    fn negative_port_reaches_validation() {
        let cli = Cli::try_parse_from(["port-filter", "xdp", "--port", "-1"]).unwrap();
        let Some(Commands::Xdp(args)) = cli.command else {
            panic!("expected xdp subcommand");
        };
        assert!(matches!(
            XdpOptions::try_from(args),
            Err(FilterError::InvalidPolicyValue { value: -1 })
        ));
    }

    #[test]
    fn failed_detach_still_exits_zero() {
        let report = DrainReport {
            detached: 1,
            failures: vec![FilterError::DetachFailed {
                link: "cgroup_allow_port_bind4 on cgroup/bind /sys/fs/cgroup/demo".into(),
                reason: "No such file or directory".into(),
            }],
        };
        assert_eq!(shutdown_exit_code(&report), 0);
        assert_eq!(shutdown_exit_code(&DrainReport::default()), 0);
    }
}

use std::path::PathBuf;

use clap::Args;
use port_filter_common::{DEFAULT_PORT, cgroup, xdp};

use crate::{
    attach::{AttachOptions, CgroupMode, XdpMode},
    error::FilterError,
    policy::PolicyPort,
};

#[derive(Args, Debug)]
pub struct CgroupArgs {
    /// Path to a cgroup v2 directory (or cgroup v1 net_cls cgroup)
    #[arg(long, value_name = "DIR")]
    pub cgroup: PathBuf,
    /// TCP port processes in the cgroup may use
    #[arg(long, default_value_t = DEFAULT_PORT as i64, allow_negative_numbers = true)]
    pub port: i64,
    /// Compiled program object
    #[arg(long, value_name = "PATH", default_value = cgroup::DEFAULT_OBJECT)]
    pub obj: PathBuf,
    /// Array map receiving the port in slot 0
    #[arg(long, default_value = cgroup::POLICY_MAP)]
    pub map: String,
    /// cgroup/connect4 program covering outgoing connections
    #[arg(long, default_value = cgroup::CONNECT_PROGRAM)]
    pub connect_program: String,
    /// cgroup/bind4 program covering listening servers
    #[arg(long, default_value = cgroup::BIND_PROGRAM)]
    pub bind_program: String,
    /// How to share the cgroup hooks with other programs
    #[arg(long, value_enum, default_value_t = CgroupMode::Single)]
    pub attach_mode: CgroupMode,
}

#[derive(Args, Debug)]
pub struct XdpArgs {
    /// Network interface to attach the XDP program to
    #[arg(long, value_name = "IFACE", default_value = xdp::DEFAULT_IFACE)]
    pub iface: String,
    /// Destination or source TCP port to drop
    #[arg(long, default_value_t = DEFAULT_PORT as i64, allow_negative_numbers = true)]
    pub port: i64,
    /// Compiled program object
    #[arg(long, value_name = "PATH", default_value = xdp::DEFAULT_OBJECT)]
    pub obj: PathBuf,
    /// Array map receiving the port in slot 0
    #[arg(long, default_value = xdp::POLICY_MAP)]
    pub map: String,
    /// XDP program name
    #[arg(long, default_value = xdp::PROGRAM)]
    pub program: String,
    /// XDP attach mode (auto lets the kernel choose native or generic)
    #[arg(long, value_enum, default_value_t = XdpMode::Auto)]
    pub xdp_mode: XdpMode,
}

#[derive(Clone, Debug)]
pub struct CgroupOptions {
    pub object: PathBuf,
    pub cgroup: PathBuf,
    pub port: PolicyPort,
    pub map: String,
    pub connect_program: String,
    pub bind_program: String,
    pub attach: AttachOptions,
}

#[derive(Clone, Debug)]
pub struct XdpOptions {
    pub object: PathBuf,
    pub iface: String,
    pub port: PolicyPort,
    pub map: String,
    pub program: String,
    pub attach: AttachOptions,
}

fn require(value: &str, what: &str) -> Result<(), FilterError> {
    if value.trim().is_empty() {
        return Err(FilterError::Config(format!("{what} must not be empty")));
    }
    Ok(())
}

impl TryFrom<CgroupArgs> for CgroupOptions {
    type Error = FilterError;

    fn try_from(args: CgroupArgs) -> Result<Self, Self::Error> {
        let port = PolicyPort::new(args.port)?;
        if args.cgroup.as_os_str().is_empty() {
            return Err(FilterError::Config("must provide --cgroup path".into()));
        }
        require(&args.map, "map name")?;
        require(&args.connect_program, "connect program name")?;
        require(&args.bind_program, "bind program name")?;
        if args.connect_program == args.bind_program {
            return Err(FilterError::Config(
                "connect and bind programs must differ".into(),
            ));
        }
        Ok(Self {
            object: args.obj,
            cgroup: args.cgroup,
            port,
            map: args.map,
            connect_program: args.connect_program,
            bind_program: args.bind_program,
            attach: AttachOptions {
                cgroup_mode: args.attach_mode,
                ..Default::default()
            },
        })
    }
}

impl TryFrom<XdpArgs> for XdpOptions {
    type Error = FilterError;

    fn try_from(args: XdpArgs) -> Result<Self, Self::Error> {
        let port = PolicyPort::new(args.port)?;
        require(&args.iface, "interface name")?;
        require(&args.map, "map name")?;
        require(&args.program, "program name")?;
        Ok(Self {
            object: args.obj,
            iface: args.iface,
            port,
            map: args.map,
            program: args.program,
            attach: AttachOptions {
                xdp_mode: args.xdp_mode,
                ..Default::default()
            },
        })
    }
}

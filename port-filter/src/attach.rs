use std::{
    collections::HashSet,
    ffi::CString,
    fmt,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use aya::programs::{
    CgroupAttachMode, CgroupSockAddr, Xdp, XdpFlags, cgroup_sock_addr::CgroupSockAddrLinkId,
    xdp::XdpLinkId,
};
use clap::ValueEnum;
use log::debug;

use crate::{collection::Collection, error::FilterError, object::ProgramKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CgroupDirection {
    /// Outgoing connections made by processes in the cgroup.
    Connect,
    /// Sockets bound by servers in the cgroup.
    Bind,
}

impl fmt::Display for CgroupDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupDirection::Connect => f.write_str("connect"),
            CgroupDirection::Bind => f.write_str("bind"),
        }
    }
}

/// Where a program gets attached. Resolved once, before any attach call.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum HookTarget {
    Cgroup {
        path: PathBuf,
        direction: CgroupDirection,
    },
    /// Interface ingress. The kernel only knows the index; the name is kept
    /// for messages.
    Interface { name: String, index: u32 },
}

impl HookTarget {
    pub fn cgroup<P: AsRef<Path>>(path: P, direction: CgroupDirection) -> Result<Self, FilterError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(FilterError::AttachFailed {
                target: format!("cgroup/{direction} {}", path.display()),
                reason: "not an existing cgroup directory".to_string(),
            });
        }
        Ok(HookTarget::Cgroup {
            path: path.to_path_buf(),
            direction,
        })
    }

    pub fn interface(name: &str) -> Result<Self, FilterError> {
        let index = resolve_interface(name)?;
        debug!("interface {name} has index {index}");
        Ok(HookTarget::Interface {
            name: name.to_string(),
            index,
        })
    }
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookTarget::Cgroup { path, direction } => {
                write!(f, "cgroup/{direction} {}", path.display())
            }
            HookTarget::Interface { name, index } => {
                write!(f, "xdp ingress {name} (ifindex {index})")
            }
        }
    }
}

pub fn resolve_interface(name: &str) -> Result<u32, FilterError> {
    let c_name = CString::new(name).map_err(|_| FilterError::InterfaceNotFound {
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"),
    })?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(FilterError::InterfaceNotFound {
            name: name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(index)
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum CgroupMode {
    /// Fail if another program already owns the hook.
    #[default]
    Single,
    AllowOverride,
    AllowMultiple,
}

impl From<CgroupMode> for CgroupAttachMode {
    fn from(mode: CgroupMode) -> Self {
        match mode {
            CgroupMode::Single => CgroupAttachMode::Single,
            CgroupMode::AllowOverride => CgroupAttachMode::AllowOverride,
            CgroupMode::AllowMultiple => CgroupAttachMode::AllowMultiple,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    /// Let the kernel pick: native if the driver supports it, generic otherwise.
    #[default]
    Auto,
    Skb,
    Driver,
    Hw,
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Auto => XdpFlags::default(),
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AttachOptions {
    pub cgroup_mode: CgroupMode,
    pub xdp_mode: XdpMode,
}

enum LinkId {
    CgroupSockAddr(CgroupSockAddrLinkId),
    Xdp(XdpLinkId),
}

/// A program bound to a hook. Filtering stops once it is detached.
pub struct Link {
    program: String,
    target: HookTarget,
    id: LinkId,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.program, self.target)
    }
}

/// (program, target) pairs currently attached through one collection.
///
/// A second attach of the same pair is refused before reaching the kernel,
/// so the existing link is never disturbed.
#[derive(Debug, Default)]
pub struct AttachRegistry {
    live: HashSet<(String, HookTarget)>,
}

impl AttachRegistry {
    pub fn claim(&mut self, program: &str, target: &HookTarget) -> Result<(), FilterError> {
        if !self.live.insert((program.to_string(), target.clone())) {
            return Err(FilterError::AttachFailed {
                target: target.to_string(),
                reason: format!("program {program} is already attached here"),
            });
        }
        Ok(())
    }

    pub fn release(&mut self, program: &str, target: &HookTarget) {
        self.live.remove(&(program.to_string(), target.clone()));
    }
}

/// Checks that a program compiled for `kind` can serve `target`.
pub fn ensure_compatible(
    program: &str,
    kind: &ProgramKind,
    target: &HookTarget,
) -> Result<(), FilterError> {
    let compatible = match target {
        HookTarget::Cgroup {
            direction: CgroupDirection::Connect,
            ..
        } => kind.is_cgroup_connect(),
        HookTarget::Cgroup {
            direction: CgroupDirection::Bind,
            ..
        } => kind.is_cgroup_bind(),
        HookTarget::Interface { .. } => *kind == ProgramKind::Xdp,
    };
    if !compatible {
        return Err(FilterError::AttachFailed {
            target: target.to_string(),
            reason: format!("program {program} is a {kind} program"),
        });
    }
    Ok(())
}

pub fn attach(
    collection: &mut Collection,
    program: &str,
    target: &HookTarget,
    opts: AttachOptions,
) -> Result<Link, FilterError> {
    let kind = collection.program_kind(program)?;
    ensure_compatible(program, kind, target)?;
    collection.registry.claim(program, target)?;

    let attached = match target {
        HookTarget::Cgroup { path, .. } => {
            attach_cgroup(collection, program, target, path, opts.cgroup_mode)
                .map(LinkId::CgroupSockAddr)
        }
        HookTarget::Interface { index, .. } => {
            attach_xdp(collection, program, target, *index, opts.xdp_mode).map(LinkId::Xdp)
        }
    };
    match attached {
        Ok(id) => {
            debug!("attached {program} to {target}");
            Ok(Link {
                program: program.to_string(),
                target: target.clone(),
                id,
            })
        }
        Err(err) => {
            collection.registry.release(program, target);
            Err(err)
        }
    }
}

fn attach_cgroup(
    collection: &mut Collection,
    program: &str,
    target: &HookTarget,
    path: &Path,
    mode: CgroupMode,
) -> Result<CgroupSockAddrLinkId, FilterError> {
    let failed = |reason: String| FilterError::AttachFailed {
        target: target.to_string(),
        reason,
    };
    let cgroup = File::open(path)
        .map_err(|e| failed(format!("failed to open {}: {e}", path.display())))?;
    let prog: &mut CgroupSockAddr = collection
        .ebpf
        .program_mut(program)
        .ok_or_else(|| failed(format!("program {program} not found")))?
        .try_into()
        .map_err(|e| failed(format!("program {program} has wrong type: {e}")))?;
    prog.attach(cgroup, mode.into())
        .map_err(|e| failed(format!("kernel refused {program}: {e}")))
}

fn attach_xdp(
    collection: &mut Collection,
    program: &str,
    target: &HookTarget,
    if_index: u32,
    mode: XdpMode,
) -> Result<XdpLinkId, FilterError> {
    let failed = |reason: String| FilterError::AttachFailed {
        target: target.to_string(),
        reason,
    };
    let prog: &mut Xdp = collection
        .ebpf
        .program_mut(program)
        .ok_or_else(|| failed(format!("program {program} not found")))?
        .try_into()
        .map_err(|e| failed(format!("program {program} has wrong type: {e}")))?;
    prog.attach_to_if_index(if_index, xdp_flags(mode))
        .map_err(|e| failed(format!("kernel refused {program}: {e}")))
}

pub fn detach(collection: &mut Collection, link: Link) -> Result<(), FilterError> {
    let Link {
        program,
        target,
        id,
    } = link;
    let failed = |reason: String| FilterError::DetachFailed {
        link: format!("{program} on {target}"),
        reason,
    };
    let result = match id {
        LinkId::CgroupSockAddr(id) => {
            let prog: &mut CgroupSockAddr = collection
                .ebpf
                .program_mut(&program)
                .ok_or_else(|| failed(format!("program {program} not found")))?
                .try_into()
                .map_err(|e| failed(format!("cgroup program has wrong type: {e}")))?;
            prog.detach(id)
        }
        LinkId::Xdp(id) => {
            let prog: &mut Xdp = collection
                .ebpf
                .program_mut(&program)
                .ok_or_else(|| failed(format!("program {program} not found")))?
                .try_into()
                .map_err(|e| failed(format!("xdp program has wrong type: {e}")))?;
            prog.detach(id)
        }
    };
    collection.registry.release(&program, &target);
    result.map_err(|e| failed(e.to_string()))
}

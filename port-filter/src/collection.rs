use std::collections::BTreeMap;

use aya::{
    Ebpf, EbpfError, EbpfLoader,
    maps::{Array, MapError},
    programs::{Program, ProgramError},
    sys::SyscallError,
};
use log::{debug, warn};

use crate::{
    attach::{self, AttachOptions, AttachRegistry, HookTarget, Link},
    error::{FilterError, ObjectKind},
    lifecycle::Attachable,
    object::{ProgramKind, ProgramSpec},
    policy::ArraySlot,
    supervisor::Teardown,
};

/// Live maps and programs instantiated from a [`ProgramSpec`].
///
/// Dropping the collection closes every map and program descriptor it owns,
/// so a collection is only ever handed out once all of them exist.
pub struct Collection {
    pub(crate) ebpf: Ebpf,
    kinds: BTreeMap<String, ProgramKind>,
    pub(crate) registry: AttachRegistry,
}

impl Collection {
    pub fn build(spec: ProgramSpec) -> Result<Self, FilterError> {
        let (bytes, kinds) = spec.into_parts();

        let mut ebpf = EbpfLoader::new().load(&bytes).map_err(build_error)?;
        // On error `ebpf` is dropped here, taking the maps and any programs
        // already loaded in this call with it.
        load_programs(&mut ebpf)?;

        debug!(
            "collection ready: {} map(s), {} program(s)",
            ebpf.maps().count(),
            kinds.len()
        );
        Ok(Self {
            ebpf,
            kinds,
            registry: AttachRegistry::default(),
        })
    }

    pub fn program_kind(&self, name: &str) -> Result<&ProgramKind, FilterError> {
        self.kinds.get(name).ok_or_else(|| FilterError::NameNotFound {
            kind: ObjectKind::Program,
            name: name.to_string(),
        })
    }

    pub fn policy_slot<'a>(&'a mut self, name: &'a str) -> Result<ArraySlot<'a>, FilterError> {
        let map = self
            .ebpf
            .map_mut(name)
            .ok_or_else(|| FilterError::NameNotFound {
                kind: ObjectKind::Map,
                name: name.to_string(),
            })?;
        let array = Array::<_, u16>::try_from(map).map_err(|e| FilterError::MapWriteFailed {
            map: name.to_string(),
            reason: format!("not a u16 array map: {e}"),
        })?;
        Ok(ArraySlot::new(name, array))
    }

    /// Reads `slots` from an optional `u64` array map. `Ok(None)` when the
    /// object does not declare the map.
    pub fn read_counters(&self, name: &str, slots: &[u32]) -> Result<Option<Vec<u64>>, MapError> {
        let Some(map) = self.ebpf.map(name) else {
            return Ok(None);
        };
        let array = Array::<_, u64>::try_from(map)?;
        slots
            .iter()
            .map(|slot| array.get(slot, 0))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

impl Teardown for Collection {
    type Link = Link;

    fn detach(&mut self, link: Link) -> Result<(), FilterError> {
        attach::detach(self, link)
    }

    fn release(self) -> Result<(), FilterError> {
        debug!("closing {} program(s)", self.kinds.len());
        drop(self.ebpf);
        Ok(())
    }
}

impl Attachable for Collection {
    type Slot<'a> = ArraySlot<'a>;

    fn policy_slot<'a>(&'a mut self, map: &'a str) -> Result<ArraySlot<'a>, FilterError> {
        Collection::policy_slot(self, map)
    }

    fn attach(
        &mut self,
        program: &str,
        target: &HookTarget,
        opts: AttachOptions,
    ) -> Result<Link, FilterError> {
        attach::attach(self, program, target, opts)
    }
}

fn load_programs(ebpf: &mut Ebpf) -> Result<(), FilterError> {
    for (name, program) in ebpf.programs_mut() {
        let result = match program {
            Program::CgroupSockAddr(p) => p.load(),
            Program::Xdp(p) => p.load(),
            Program::SchedClassifier(p) => p.load(),
            Program::CgroupSkb(p) => p.load(),
            Program::CgroupSock(p) => p.load(),
            Program::SocketFilter(p) => p.load(),
            Program::SockOps(p) => p.load(),
            _ => {
                warn!("program {name} needs load-time arguments, leaving it unloaded");
                continue;
            }
        };
        result.map_err(|e| program_load_error(name, e))?;
        debug!("loaded program {name}");
    }
    Ok(())
}

fn build_error(err: EbpfError) -> FilterError {
    match err {
        EbpfError::MapError(MapError::CreateError { name, io_error, .. }) => {
            FilterError::from_kernel(format!("creating map {name}"), io_error, |action, source| {
                if source.raw_os_error() == Some(libc::EINVAL) {
                    FilterError::ObjectMalformed {
                        reason: format!("{action}: {source}"),
                    }
                } else {
                    FilterError::ResourceExhausted { action, source }
                }
            })
        }
        other => FilterError::ObjectMalformed {
            reason: other.to_string(),
        },
    }
}

fn program_load_error(program: &str, err: ProgramError) -> FilterError {
    match err {
        ProgramError::LoadError {
            io_error,
            verifier_log,
        } => {
            let verifier_log = verifier_log.to_string();
            if !verifier_log.is_empty() {
                debug!("verifier log for {program}:\n{verifier_log}");
            }
            FilterError::from_kernel(
                format!("loading program {program}"),
                io_error,
                |_, source| FilterError::VerificationRejected {
                    program: program.to_string(),
                    verifier_log,
                    source,
                },
            )
        }
        ProgramError::SyscallError(SyscallError { call, io_error }) => FilterError::from_kernel(
            format!("{call} for program {program}"),
            io_error,
            |action, source| FilterError::VerificationRejected {
                program: program.to_string(),
                verifier_log: format!("{action} failed"),
                source,
            },
        ),
        other => FilterError::ObjectMalformed {
            reason: format!("program {program}: {other}"),
        },
    }
}

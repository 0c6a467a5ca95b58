use std::{collections::BTreeMap, fmt, fs, path::Path};

use aya_obj::{Object, ProgramSection, programs::CgroupSockAddrAttachType};
use log::debug;

use crate::error::{FilterError, ObjectKind};

/// Hook a program was compiled for, taken from its ELF section name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProgramKind {
    CgroupConnect4,
    CgroupConnect6,
    CgroupBind4,
    CgroupBind6,
    Xdp,
    Other(String),
}

impl ProgramKind {
    fn from_section(section: &ProgramSection) -> Self {
        match section {
            ProgramSection::CgroupSockAddr { attach_type, .. } => match attach_type {
                CgroupSockAddrAttachType::Connect4 => ProgramKind::CgroupConnect4,
                CgroupSockAddrAttachType::Connect6 => ProgramKind::CgroupConnect6,
                CgroupSockAddrAttachType::Bind4 => ProgramKind::CgroupBind4,
                CgroupSockAddrAttachType::Bind6 => ProgramKind::CgroupBind6,
                other => ProgramKind::Other(format!("cgroup_sock_addr {other:?}")),
            },
            ProgramSection::Xdp { .. } => ProgramKind::Xdp,
            other => ProgramKind::Other(format!("{other:?}")),
        }
    }

    pub fn is_cgroup_connect(&self) -> bool {
        matches!(self, ProgramKind::CgroupConnect4 | ProgramKind::CgroupConnect6)
    }

    pub fn is_cgroup_bind(&self) -> bool {
        matches!(self, ProgramKind::CgroupBind4 | ProgramKind::CgroupBind6)
    }
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramKind::CgroupConnect4 => f.write_str("cgroup/connect4"),
            ProgramKind::CgroupConnect6 => f.write_str("cgroup/connect6"),
            ProgramKind::CgroupBind4 => f.write_str("cgroup/bind4"),
            ProgramKind::CgroupBind6 => f.write_str("cgroup/bind6"),
            ProgramKind::Xdp => f.write_str("xdp"),
            ProgramKind::Other(section) => write!(f, "unsupported section {section}"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapSpec {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

/// Parsed view of a compiled program object. Never touches the kernel.
#[derive(Debug)]
pub struct ProgramSpec {
    bytes: Vec<u8>,
    maps: BTreeMap<String, MapSpec>,
    programs: BTreeMap<String, ProgramKind>,
}

impl ProgramSpec {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| FilterError::ObjectNotFound {
            path: path.to_path_buf(),
            source,
        })?;
        let spec = Self::from_bytes(bytes)?;
        debug!(
            "parsed {}: maps {:?}, programs {:?}",
            path.display(),
            spec.maps.keys().collect::<Vec<_>>(),
            spec.programs.keys().collect::<Vec<_>>()
        );
        Ok(spec)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, FilterError> {
        let object = Object::parse(&bytes).map_err(|e| FilterError::ObjectMalformed {
            reason: e.to_string(),
        })?;

        let maps = object
            .maps
            .iter()
            .map(|(name, map)| {
                let spec = MapSpec {
                    map_type: map.map_type(),
                    key_size: map.key_size(),
                    value_size: map.value_size(),
                    max_entries: map.max_entries(),
                };
                (name.clone(), spec)
            })
            .collect();
        let programs = object
            .programs
            .iter()
            .map(|(name, program)| (name.clone(), ProgramKind::from_section(&program.section)))
            .collect();

        Ok(Self {
            bytes,
            maps,
            programs,
        })
    }

    pub fn map(&self, name: &str) -> Option<&MapSpec> {
        self.maps.get(name)
    }

    pub fn program(&self, name: &str) -> Option<&ProgramKind> {
        self.programs.get(name)
    }

    pub fn require_map(&self, name: &str) -> Result<&MapSpec, FilterError> {
        self.map(name).ok_or_else(|| FilterError::NameNotFound {
            kind: ObjectKind::Map,
            name: name.to_string(),
        })
    }

    pub fn require_program(&self, name: &str) -> Result<&ProgramKind, FilterError> {
        self.program(name).ok_or_else(|| FilterError::NameNotFound {
            kind: ObjectKind::Program,
            name: name.to_string(),
        })
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, BTreeMap<String, ProgramKind>) {
        (self.bytes, self.programs)
    }
}

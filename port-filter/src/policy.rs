use std::{fmt, num::NonZeroU16, str::FromStr};

use aya::maps::{Array, MapData};
use log::debug;
use port_filter_common::POLICY_SLOT;

use crate::error::FilterError;

/// TCP port the filter programs enforce. Always in `1..=65535`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PolicyPort(NonZeroU16);

impl PolicyPort {
    pub fn new(value: i64) -> Result<Self, FilterError> {
        u16::try_from(value)
            .ok()
            .and_then(NonZeroU16::new)
            .map(Self)
            .ok_or(FilterError::InvalidPolicyValue { value })
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl FromStr for PolicyPort {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|_| FilterError::Config(format!("port '{s}' is not a number")))?;
        Self::new(value)
    }
}

impl fmt::Display for PolicyPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single-slot map the policy is written into.
pub trait PolicySlot {
    fn name(&self) -> &str;
    fn store(&mut self, key: u32, value: u16) -> Result<(), FilterError>;
    fn load(&self, key: u32) -> Result<u16, FilterError>;
}

/// Kernel array map holding `u16` values in host byte order.
pub struct ArraySlot<'a> {
    name: &'a str,
    array: Array<&'a mut MapData, u16>,
}

impl<'a> ArraySlot<'a> {
    pub fn new(name: &'a str, array: Array<&'a mut MapData, u16>) -> Self {
        Self { name, array }
    }
}

impl PolicySlot for ArraySlot<'_> {
    fn name(&self) -> &str {
        self.name
    }

    fn store(&mut self, key: u32, value: u16) -> Result<(), FilterError> {
        self.array
            .set(key, value, 0)
            .map_err(|e| FilterError::MapWriteFailed {
                map: self.name.to_string(),
                reason: e.to_string(),
            })
    }

    fn load(&self, key: u32) -> Result<u16, FilterError> {
        self.array
            .get(&key, 0)
            .map_err(|e| FilterError::MapWriteFailed {
                map: self.name.to_string(),
                reason: format!("read back failed: {e}"),
            })
    }
}

/// Writes `port` into slot zero and checks the kernel kept it.
pub fn inject<S: PolicySlot + ?Sized>(slot: &mut S, port: PolicyPort) -> Result<(), FilterError> {
    slot.store(POLICY_SLOT, port.get())?;
    let stored = read_back(slot)?;
    if stored != port.get() {
        return Err(FilterError::MapWriteFailed {
            map: slot.name().to_string(),
            reason: format!("slot {POLICY_SLOT} holds {stored} after writing {port}"),
        });
    }
    debug!("policy map {} slot {POLICY_SLOT} = {port}", slot.name());
    Ok(())
}

pub fn read_back<S: PolicySlot + ?Sized>(slot: &S) -> Result<u16, FilterError> {
    slot.load(POLICY_SLOT)
}

#![no_std]

// Names and slot layout shared between the loader and the filter objects.
// Keep this crate `no_std` friendly so an eBPF crate can depend on it too.

/// Key of the single-slot policy map. The filter programs always look up
/// slot zero.
pub const POLICY_SLOT: u32 = 0;

/// Port written into the policy slot when the operator does not pick one.
pub const DEFAULT_PORT: u16 = 4040;

/// Object produced for the cgroup socket hooks.
///
/// C-like layout of the policy map:
/*
struct {
    __uint(type, BPF_MAP_TYPE_ARRAY);
    __uint(max_entries, 1);
    __type(key, __u32);
    __type(value, __u16);  // host byte order
} allowed_port SEC(".maps");
*/
pub mod cgroup {
    pub const DEFAULT_OBJECT: &str = "../bpf/cgroup_allow_port.o";
    pub const POLICY_MAP: &str = "allowed_port";
    /// `cgroup/connect4`: outgoing client connections.
    pub const CONNECT_PROGRAM: &str = "cgroup_allow_port_v4";
    /// `cgroup/bind4`: listening servers inside the cgroup.
    pub const BIND_PROGRAM: &str = "cgroup_allow_port_bind4";
}

/// Object produced for the interface ingress (XDP) hook.
pub mod xdp {
    pub const DEFAULT_OBJECT: &str = "../bpf/drop_port.o";
    pub const DEFAULT_IFACE: &str = "eth0";
    pub const POLICY_MAP: &str = "blocked_port";
    pub const PROGRAM: &str = "xdp_drop_port";

    /// Optional `u64` array map the drop program bumps per packet.
    pub const DEBUG_COUNTERS_MAP: &str = "debug_counters";
    pub const COUNTER_PORT_MATCHES: u32 = 0;
    pub const COUNTER_DROPPED_PACKETS: u32 = 1;
}

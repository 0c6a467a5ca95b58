use log::{debug, info, warn};
use port_filter_common::xdp::{COUNTER_DROPPED_PACKETS, COUNTER_PORT_MATCHES, DEBUG_COUNTERS_MAP};

use crate::{
    attach::{AttachOptions, CgroupDirection, HookTarget},
    collection::Collection,
    config::{CgroupOptions, XdpOptions},
    error::{FilterError, Stage, StageError, StageExt},
    object::ProgramSpec,
    policy::{self, PolicyPort, PolicySlot},
    shutdown::Shutdown,
    supervisor::{DrainReport, Supervisor, Teardown},
};

/// A built collection that can be configured and attached.
pub trait Attachable: Teardown {
    type Slot<'a>: PolicySlot
    where
        Self: 'a;

    fn policy_slot<'a>(&'a mut self, map: &'a str) -> Result<Self::Slot<'a>, FilterError>;

    fn attach(
        &mut self,
        program: &str,
        target: &HookTarget,
        opts: AttachOptions,
    ) -> Result<Self::Link, FilterError>;
}

/// Loads the cgroup object, writes the allowed port and keeps the
/// connect4 + bind4 programs attached until `shutdown` fires.
pub async fn run_cgroup(opts: CgroupOptions, shutdown: Shutdown) -> Result<DrainReport, StageError> {
    raise_memlock_limit();

    let spec = ProgramSpec::from_path(&opts.object).stage(Stage::Load)?;
    spec.require_map(&opts.map).stage(Stage::Load)?;
    spec.require_program(&opts.connect_program).stage(Stage::Load)?;
    spec.require_program(&opts.bind_program).stage(Stage::Load)?;

    let collection = Collection::build(spec).stage(Stage::Build)?;
    let supervisor = install_cgroup(collection, &opts, shutdown)?;
    println!("{}", cgroup_confirmation(&opts));

    let report = supervisor.run().await;
    println!(
        "Detached {} link(s) from {}.",
        report.detached,
        opts.cgroup.display()
    );
    Ok(report)
}

/// Loads the drop object, writes the blocked port and keeps the XDP program
/// attached to the interface until `shutdown` fires.
pub async fn run_xdp(opts: XdpOptions, shutdown: Shutdown) -> Result<DrainReport, StageError> {
    raise_memlock_limit();

    let spec = ProgramSpec::from_path(&opts.object).stage(Stage::Load)?;
    spec.require_map(&opts.map).stage(Stage::Load)?;
    spec.require_program(&opts.program).stage(Stage::Load)?;

    let collection = Collection::build(spec).stage(Stage::Build)?;
    let mut supervisor = install_xdp(collection, &opts, shutdown)?;
    println!("{}", xdp_confirmation(&opts));

    supervisor.wait_for_shutdown().await;
    log_drop_counters(supervisor.resources());
    let report = supervisor.drain();
    println!("Detached XDP program from {}.", opts.iface);
    Ok(report)
}

/// Writes the policy, then attaches connect before bind. On error the
/// returned supervisor is dropped, which releases whatever was acquired.
pub fn install_cgroup<T: Attachable>(
    resources: T,
    opts: &CgroupOptions,
    shutdown: Shutdown,
) -> Result<Supervisor<T>, StageError> {
    let mut supervisor = Supervisor::new(resources, shutdown);
    configure(&mut supervisor, &opts.map, opts.port).stage(Stage::Configure)?;

    let connect = HookTarget::cgroup(&opts.cgroup, CgroupDirection::Connect).stage(Stage::Attach)?;
    let bind = HookTarget::cgroup(&opts.cgroup, CgroupDirection::Bind).stage(Stage::Attach)?;
    for (program, target) in [(&opts.connect_program, &connect), (&opts.bind_program, &bind)] {
        supervisor
            .acquire(|resources| resources.attach(program, target, opts.attach))
            .stage(Stage::Attach)?;
    }
    supervisor.mark_attached();
    Ok(supervisor)
}

/// Writes the policy, resolves the interface and attaches the XDP program.
pub fn install_xdp<T: Attachable>(
    resources: T,
    opts: &XdpOptions,
    shutdown: Shutdown,
) -> Result<Supervisor<T>, StageError> {
    let mut supervisor = Supervisor::new(resources, shutdown);
    configure(&mut supervisor, &opts.map, opts.port).stage(Stage::Configure)?;

    let target = HookTarget::interface(&opts.iface).stage(Stage::Attach)?;
    supervisor
        .acquire(|resources| resources.attach(&opts.program, &target, opts.attach))
        .stage(Stage::Attach)?;
    supervisor.mark_attached();
    Ok(supervisor)
}

fn cgroup_confirmation(opts: &CgroupOptions) -> String {
    format!(
        "Attached connect4 (outgoing client) and bind4 (incoming server) to {}, allowing TCP port {}. Press Ctrl+C to detach.",
        opts.cgroup.display(),
        opts.port
    )
}

fn xdp_confirmation(opts: &XdpOptions) -> String {
    format!(
        "XDP drop attached on interface {} dropping TCP port {}. Press Ctrl+C to detach.",
        opts.iface, opts.port
    )
}

fn configure<T: Attachable>(
    supervisor: &mut Supervisor<T>,
    map: &str,
    port: PolicyPort,
) -> Result<(), FilterError> {
    let mut slot = supervisor.resources_mut().policy_slot(map)?;
    policy::inject(&mut slot, port)?;
    info!("policy map {map} set to port {port}");
    Ok(())
}

fn log_drop_counters(collection: &Collection) {
    match collection.read_counters(
        DEBUG_COUNTERS_MAP,
        &[COUNTER_PORT_MATCHES, COUNTER_DROPPED_PACKETS],
    ) {
        Ok(Some(values)) => {
            if let [matches, dropped] = values[..] {
                info!("port matches: {matches}, dropped packets: {dropped}");
            }
        }
        Ok(None) => debug!("object has no {DEBUG_COUNTERS_MAP} map"),
        Err(err) => warn!("failed to read {DEBUG_COUNTERS_MAP}: {err}"),
    }
}

/// Older kernels charge BPF memory against RLIMIT_MEMLOCK.
fn raise_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, fmt, io::Write, path::PathBuf, rc::Rc};

    use super::*;
    use crate::{attach::XdpMode, supervisor::State};

    #[derive(Debug, Eq, PartialEq)]
    enum Event {
        Store(String, u16),
        Attach(String, HookTarget),
        Detach(String),
        Release,
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct FakeLink(String);

    impl fmt::Display for FakeLink {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// In-memory collection: one policy map, attach calls recorded in order.
    struct FakeCollection {
        events: Log,
        policy: HashMap<u32, u16>,
        refuse: Option<&'static str>,
    }

    impl FakeCollection {
        fn new() -> (Self, Log) {
            let events = Log::default();
            let collection = Self {
                events: events.clone(),
                policy: HashMap::new(),
                refuse: None,
            };
            (collection, events)
        }
    }

    struct FakeSlot<'a> {
        name: &'a str,
        collection: &'a mut FakeCollection,
    }

    impl PolicySlot for FakeSlot<'_> {
        fn name(&self) -> &str {
            self.name
        }

        fn store(&mut self, key: u32, value: u16) -> Result<(), FilterError> {
            self.collection
                .events
                .borrow_mut()
                .push(Event::Store(self.name.to_string(), value));
            self.collection.policy.insert(key, value);
            Ok(())
        }

        fn load(&self, key: u32) -> Result<u16, FilterError> {
            self.collection
                .policy
                .get(&key)
                .copied()
                .ok_or_else(|| FilterError::MapWriteFailed {
                    map: self.name.to_string(),
                    reason: format!("slot {key} empty"),
                })
        }
    }

    impl Teardown for FakeCollection {
        type Link = FakeLink;

        fn detach(&mut self, link: FakeLink) -> Result<(), FilterError> {
            self.events.borrow_mut().push(Event::Detach(link.0));
            Ok(())
        }

        fn release(self) -> Result<(), FilterError> {
            self.events.borrow_mut().push(Event::Release);
            Ok(())
        }
    }

    impl Attachable for FakeCollection {
        type Slot<'a> = FakeSlot<'a>;

        fn policy_slot<'a>(&'a mut self, map: &'a str) -> Result<FakeSlot<'a>, FilterError> {
            Ok(FakeSlot {
                name: map,
                collection: self,
            })
        }

        fn attach(
            &mut self,
            program: &str,
            target: &HookTarget,
            _opts: AttachOptions,
        ) -> Result<FakeLink, FilterError> {
            if self.refuse == Some(program) {
                return Err(FilterError::AttachFailed {
                    target: target.to_string(),
                    reason: "EBUSY".into(),
                });
            }
            self.events
                .borrow_mut()
                .push(Event::Attach(program.to_string(), target.clone()));
            Ok(FakeLink(program.to_string()))
        }
    }

    fn cgroup_opts(object: PathBuf, cgroup: PathBuf) -> CgroupOptions {
        CgroupOptions {
            object,
            cgroup,
            port: PolicyPort::new(8443).unwrap(),
            map: "policy".into(),
            connect_program: "filter_out".into(),
            bind_program: "filter_in".into(),
            attach: AttachOptions::default(),
        }
    }

    fn xdp_opts(object: PathBuf, iface: &str) -> XdpOptions {
        XdpOptions {
            object,
            iface: iface.into(),
            port: PolicyPort::new(4040).unwrap(),
            map: "blocked_port".into(),
            program: "xdp_drop_port".into(),
            attach: AttachOptions {
                xdp_mode: XdpMode::Skb,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn cgroup_policy_is_written_before_both_directions_attach() {
        let cgroup = tempfile::tempdir().unwrap();
        let opts = cgroup_opts(PathBuf::from("unused.o"), cgroup.path().to_path_buf());
        let (collection, events) = FakeCollection::new();
        let (trigger, shutdown) = Shutdown::channel();

        let supervisor = install_cgroup(collection, &opts, shutdown).unwrap();
        assert_eq!(supervisor.state(), State::Attached);
        assert_eq!(supervisor.links().len(), 2);
        assert_eq!(supervisor.resources().policy.get(&0), Some(&8443));

        let message = cgroup_confirmation(&opts);
        assert!(message.contains("connect4"), "{message}");
        assert!(message.contains("bind4"), "{message}");
        assert!(message.contains("8443"), "{message}");

        trigger.fire();
        let report = supervisor.run().await;
        assert!(report.is_clean());
        assert_eq!(report.detached, 2);

        let connect = HookTarget::Cgroup {
            path: cgroup.path().to_path_buf(),
            direction: CgroupDirection::Connect,
        };
        let bind = HookTarget::Cgroup {
            path: cgroup.path().to_path_buf(),
            direction: CgroupDirection::Bind,
        };
        assert_eq!(
            *events.borrow(),
            vec![
                Event::Store("policy".into(), 8443),
                Event::Attach("filter_out".into(), connect),
                Event::Attach("filter_in".into(), bind),
                Event::Detach("filter_in".into()),
                Event::Detach("filter_out".into()),
                Event::Release,
            ]
        );
    }

    #[test]
    fn refused_bind_attach_releases_the_connect_link() {
        let cgroup = tempfile::tempdir().unwrap();
        let opts = cgroup_opts(PathBuf::from("unused.o"), cgroup.path().to_path_buf());
        let (mut collection, events) = FakeCollection::new();
        collection.refuse = Some("filter_in");
        let (_trigger, shutdown) = Shutdown::channel();

        let err = install_cgroup(collection, &opts, shutdown).err().unwrap();
        assert_eq!(err.stage, Stage::Attach);
        assert!(matches!(err.source, FilterError::AttachFailed { .. }));

        let events = events.borrow();
        assert_eq!(events.len(), 4, "{events:?}");
        assert_eq!(events[0], Event::Store("policy".into(), 8443));
        assert_eq!(events[2], Event::Detach("filter_out".into()));
        assert_eq!(events[3], Event::Release);
    }

    #[test]
    fn missing_cgroup_directory_still_releases_configured_collection() {
        let dir = tempfile::tempdir().unwrap();
        let opts = cgroup_opts(PathBuf::from("unused.o"), dir.path().join("gone"));
        let (collection, events) = FakeCollection::new();
        let (_trigger, shutdown) = Shutdown::channel();

        let err = install_cgroup(collection, &opts, shutdown).err().unwrap();
        assert_eq!(err.stage, Stage::Attach);
        assert_eq!(
            *events.borrow(),
            vec![Event::Store("policy".into(), 8443), Event::Release]
        );
    }

    #[test]
    fn unknown_interface_fails_after_configure_and_releases_collection() {
        let opts = xdp_opts(PathBuf::from("unused.o"), "pf-missing0");
        let (collection, events) = FakeCollection::new();
        let (_trigger, shutdown) = Shutdown::channel();

        let err = install_xdp(collection, &opts, shutdown).err().unwrap();
        assert_eq!(err.stage, Stage::Attach);
        match err.source {
            FilterError::InterfaceNotFound { name, .. } => assert_eq!(name, "pf-missing0"),
            other => panic!("expected InterfaceNotFound, got {other:?}"),
        }
        assert_eq!(
            *events.borrow(),
            vec![Event::Store("blocked_port".into(), 4040), Event::Release]
        );
    }

    #[test]
    fn loopback_xdp_attach_and_drain() {
        let opts = xdp_opts(PathBuf::from("unused.o"), "lo");
        let (collection, events) = FakeCollection::new();
        let (_trigger, shutdown) = Shutdown::channel();

        let supervisor = install_xdp(collection, &opts, shutdown).unwrap();
        assert_eq!(supervisor.resources().policy.get(&0), Some(&4040));
        assert!(xdp_confirmation(&opts).contains("interface lo dropping TCP port 4040"));

        let report = supervisor.drain();
        assert_eq!(report.detached, 1);
        let events = events.borrow();
        assert_eq!(events[0], Event::Store("blocked_port".into(), 4040));
        assert!(
            matches!(&events[1], Event::Attach(program, HookTarget::Interface { name, .. })
                if program == "xdp_drop_port" && name == "lo")
        );
        assert_eq!(events[2..], [Event::Detach("xdp_drop_port".into()), Event::Release]);
    }

    #[tokio::test]
    async fn missing_object_fails_in_load_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (_trigger, shutdown) = Shutdown::channel();
        let opts = cgroup_opts(dir.path().join("missing.o"), dir.path().to_path_buf());
        let err = run_cgroup(opts, shutdown).await.unwrap_err();
        assert_eq!(err.stage, Stage::Load);
        assert!(matches!(err.source, FilterError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn malformed_object_fails_before_any_kernel_call() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 128]).unwrap();
        let (_trigger, shutdown) = Shutdown::channel();
        let opts = xdp_opts(file.path().to_path_buf(), "lo");
        let err = run_xdp(opts, shutdown).await.unwrap_err();
        assert_eq!(err.stage, Stage::Load);
        assert!(matches!(err.source, FilterError::ObjectMalformed { .. }));
    }
}

//! The QEMU-backed VM lifecycle controller.
//!
//! Public operations run on caller threads; QMP output and process events
//! arrive on a pump thread fed by the process abstraction. Everything the
//! two sides share lives in one mutex-guarded structure paired with a
//! condition variable, which also carries the shutdown-while-starting
//! handshake: a `finished` event observed in `starting` parks the pump
//! until `ensure_vm_is_running` has seen the dead child and forced the
//! state to `off`.

use std::{
    net::Ipv4Addr,
    sync::{mpsc, Arc, Condvar, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::{
    errors::VmError,
    qmp::{self, QmpEvent, QmpMessage},
    ssh::SshReachability,
    util::{try_action_for, TimeoutAction},
};

use super::{
    backend, metadata,
    process::{ExitStatusInfo, ProcessEvent, ProcessFactory, ProcessHandle},
    spec::{self, QemuProcessSpec},
    DhcpDirectory, StatusMonitor, VmDescriptor, VmMetadataStore, VmState,
};

/// Budget for discovering the VM's address through the DHCP directory.
const IP_DISCOVERY_BUDGET: Duration = Duration::from_secs(120);

/// How long to wait for a spawned child to report `started`.
const START_CONFIRMATION_BUDGET: Duration = Duration::from_secs(30);

/// Collaborators a [`QemuVm`] needs. Carried as one value to keep the
/// constructor argument list manageable.
pub struct VmDependencies {
    pub factory: Arc<dyn ProcessFactory>,
    pub dhcp: Arc<dyn DhcpDirectory>,
    pub monitor: Arc<dyn StatusMonitor>,
    pub metadata: Arc<dyn VmMetadataStore>,
    pub ssh: Arc<dyn SshReachability>,
}

/// The synchronised region shared between caller threads and the pump.
struct VmInner {
    state: VmState,
    ip: Option<Ipv4Addr>,
    saved_error_msg: String,
    /// Cleared when the controller itself is about to terminate the child,
    /// so the exit is not reinterpreted as a crash.
    update_shutdown_status: bool,
    /// Set when the most recent start resumed from a snapshot; cleared at
    /// the first post-resume SSH readiness.
    delete_memory_snapshot: bool,
}

struct VmShared {
    vm_name: String,
    inner: Mutex<VmInner>,
    state_wait: Condvar,
}

impl VmShared {
    fn lock(&self) -> MutexGuard<'_, VmInner> {
        self.inner.lock().expect("poisoned vm state mutex")
    }
}

pub struct QemuVm {
    desc: VmDescriptor,
    deps: VmDependencies,
    shared: Arc<VmShared>,
    process: Mutex<Option<Arc<dyn ProcessHandle>>>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl QemuVm {
    /// Build a controller for the described VM.
    ///
    /// The initial state is derived from the disk image: an image carrying
    /// a `suspend` snapshot starts life `suspended`, otherwise `off`.
    pub fn new(desc: VmDescriptor, deps: VmDependencies) -> Result<Self, VmError> {
        if !desc.image_path.exists() || !desc.cloud_init_path.exists() {
            return Err(VmError::MissingImage);
        }

        let initial = if backend::instance_image_has_snapshot(&desc.image_path) {
            VmState::Suspended
        } else {
            VmState::Off
        };

        let shared = Arc::new(VmShared {
            vm_name: desc.vm_name.clone(),
            inner: Mutex::new(VmInner {
                state: initial,
                ip: None,
                saved_error_msg: String::new(),
                update_shutdown_status: true,
                delete_memory_snapshot: false,
            }),
            state_wait: Condvar::new(),
        });

        Ok(Self {
            desc,
            deps,
            shared,
            process: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    pub fn vm_name(&self) -> &str {
        &self.desc.vm_name
    }

    pub fn current_state(&self) -> VmState {
        self.shared.lock().state
    }

    pub fn ssh_port(&self) -> u16 {
        22
    }

    pub fn ssh_username(&self) -> &str {
        &self.desc.ssh_username
    }

    /// Start the VM, resuming from the memory snapshot when suspended.
    pub fn start(&self) -> Result<(), VmError> {
        let mut command_version = metadata::LATEST_COMMAND_VERSION;
        let mut extra_args: Vec<String> = Vec::new();
        let resuming;
        {
            let mut inner = self.shared.lock();
            match inner.state {
                VmState::Running => return Ok(()),
                VmState::Suspending => return Err(VmError::StartWhileSuspending),
                VmState::Suspended => {
                    info!(target: "qvmctl", "{}: resuming from a suspended state", self.vm_name());
                    let meta = self.deps.metadata.retrieve_metadata_for(self.vm_name());
                    command_version = metadata::command_version_from(&meta);
                    let machine_type = metadata::machine_type_or_default(&meta, self.vm_name());
                    extra_args = spec::resume_arguments(&machine_type);
                    inner.update_shutdown_status = true;
                    inner.delete_memory_snapshot = true;
                    resuming = true;
                }
                _ => resuming = false,
            }
        }

        if !resuming {
            self.deps
                .metadata
                .update_metadata_for(self.vm_name(), metadata::generate_metadata());
        }

        let process_spec = QemuProcessSpec::new(&self.desc, command_version);
        info!(target: "qvmctl", "{}: process program '{}'", self.vm_name(), process_spec.program());
        info!(
            target: "qvmctl",
            "{}: process arguments '{}'",
            self.vm_name(),
            process_spec.arguments().join(", ")
        );

        let (process, events) = self
            .deps
            .factory
            .create_process(&process_spec)
            .map_err(VmError::SpawnFailed)?;

        *self
            .process
            .lock()
            .expect("poisoned process handle mutex") = Some(Arc::clone(&process));

        let pump = EventPump {
            shared: Arc::clone(&self.shared),
            monitor: Arc::clone(&self.deps.monitor),
            process: Arc::clone(&process),
        };
        let pump_handle = thread::spawn(move || pump.run(events));
        let previous = self
            .pump
            .lock()
            .expect("poisoned pump mutex")
            .replace(pump_handle);
        if let Some(previous) = previous {
            // The previous child has exited, so its pump has drained.
            let _ = previous.join();
        }

        process.start(&extra_args).map_err(|err| {
            error!(target: "qvmctl", "{}: {:#}", self.vm_name(), err);
            VmError::SpawnFailed(err)
        })?;

        self.wait_for_started()?;

        process
            .write_stdin(&qmp::execute("qmp_capabilities"))
            .map_err(VmError::SpawnFailed)?;

        Ok(())
    }

    fn wait_for_started(&self) -> Result<(), VmError> {
        let deadline = Instant::now() + START_CONFIRMATION_BUDGET;
        let mut inner = self.shared.lock();
        while inner.state != VmState::Starting {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(VmError::SpawnFailed(anyhow!(
                    "timed out waiting for qemu to report started"
                )));
            }
            let (guard, _) = self
                .shared
                .state_wait
                .wait_timeout(inner, remaining)
                .expect("poisoned vm state mutex");
            inner = guard;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown();
    }

    /// Shut the VM down. A suspended VM is left untouched; a booted one is
    /// asked to power down over QMP; anything else is killed.
    pub fn shutdown(&self) {
        let process = self.current_process();
        let child_running = process.as_ref().map(|p| p.running()).unwrap_or(false);

        let mut inner = self.shared.lock();
        if inner.state == VmState::Suspended {
            info!(target: "qvmctl", "{}: ignoring shutdown issued while suspended", self.vm_name());
        } else if matches!(
            inner.state,
            VmState::Running | VmState::DelayedShutdown | VmState::Unknown
        ) && child_running
        {
            let process = process.expect("running child implies a process handle");
            if let Err(err) = process.write_stdin(&qmp::execute("system_powerdown")) {
                warn!(target: "qvmctl", "{}: failed to send system_powerdown: {:#}", self.vm_name(), err);
            }
            drop(inner);
            process.wait_for_finished();
        } else {
            if inner.state == VmState::Starting {
                inner.update_shutdown_status = false;
            }
            drop(inner);
            if let Some(process) = process {
                process.kill();
                process.wait_for_finished();
            }
        }
    }

    /// Ask the guest to save its memory under the suspend tag. The actual
    /// transition to `suspended` happens when QEMU reports `RESUME` and the
    /// child is killed.
    pub fn suspend(&self) {
        let process = self.current_process();
        let child_running = process.as_ref().map(|p| p.running()).unwrap_or(false);

        let mut inner = self.shared.lock();
        if inner.state.is_running() && child_running {
            let process = process.expect("running child implies a process handle");
            if let Err(err) = process.write_stdin(&qmp::hmc(&format!(
                "savevm {}",
                metadata::SUSPEND_TAG
            ))) {
                warn!(target: "qvmctl", "{}: failed to send savevm: {:#}", self.vm_name(), err);
                return;
            }

            if inner.update_shutdown_status {
                inner.state = VmState::Suspending;
                self.persist(VmState::Suspending);
                inner.update_shutdown_status = false;
                drop(inner);
                process.wait_for_finished();
            }
        } else if matches!(inner.state, VmState::Off | VmState::Suspended) {
            info!(target: "qvmctl", "{}: ignoring suspend issued while stopped/suspended", self.vm_name());
            drop(inner);
            self.deps.monitor.on_suspend();
        }
    }

    /// Fail with the saved stderr context if the child is gone, forcing the
    /// state to `off` and waking the parked shutdown handler.
    pub fn ensure_vm_is_running(&self) -> Result<(), VmError> {
        let process = self.current_process();
        let mut inner = self.shared.lock();
        let child_running = process.map(|p| p.running()).unwrap_or(false);
        if !child_running {
            // An actual state change is needed for the condition variable
            // predicate in the shutdown handler.
            inner.state = VmState::Off;
            self.shared.state_wait.notify_all();
            return Err(VmError::start(
                self.vm_name(),
                inner.saved_error_msg.clone(),
            ));
        }
        Ok(())
    }

    /// The VM's address, discovered through the DHCP directory with a
    /// two-minute budget and cached for the lifetime of the object.
    pub fn ssh_hostname(&self) -> Result<String, VmError> {
        self.ssh_hostname_within(IP_DISCOVERY_BUDGET)
    }

    fn ssh_hostname_within(&self, budget: Duration) -> Result<String, VmError> {
        if let Some(ip) = self.shared.lock().ip {
            return Ok(ip.to_string());
        }

        let mut found: Option<Ipv4Addr> = None;
        try_action_for(
            || VmError::IpTimeout,
            budget,
            || {
                self.ensure_vm_is_running()?;
                match self.deps.dhcp.get_ip_for(&self.desc.mac_addr) {
                    Some(ip) => {
                        self.shared.lock().ip = Some(ip);
                        found = Some(ip);
                        Ok(TimeoutAction::Done)
                    }
                    None => Ok(TimeoutAction::Retry),
                }
            },
        )?;

        found.map(|ip| ip.to_string()).ok_or(VmError::IpTimeout)
    }

    /// Best-effort address: the cached value, one directory lookup, or the
    /// literal `UNKNOWN`.
    pub fn ipv4(&self) -> String {
        let mut inner = self.shared.lock();
        if let Some(ip) = inner.ip {
            return ip.to_string();
        }
        match self.deps.dhcp.get_ip_for(&self.desc.mac_addr) {
            Some(ip) => {
                inner.ip = Some(ip);
                ip.to_string()
            }
            None => "UNKNOWN".to_string(),
        }
    }

    pub fn ipv6(&self) -> String {
        String::new()
    }

    /// Poll SSH reachability until the guest answers, marking the VM
    /// `running`. The first readiness after a snapshot resume also deletes
    /// the memory snapshot.
    pub fn wait_until_ssh_up(&self, timeout: Duration) -> Result<(), VmError> {
        try_action_for(
            || {
                let mut inner = self.shared.lock();
                inner.state = VmState::Unknown;
                self.persist(VmState::Unknown);
                drop(inner);
                VmError::SshTimeout {
                    vm_name: self.vm_name().to_string(),
                }
            },
            timeout,
            || {
                self.ensure_vm_is_running()?;
                let host = match self.ssh_hostname() {
                    Ok(host) => host,
                    Err(err @ VmError::Start { .. }) => return Err(err),
                    Err(_) => return Ok(TimeoutAction::Retry),
                };
                if self.deps.ssh.can_connect(&host, self.ssh_port()) {
                    let mut inner = self.shared.lock();
                    inner.state = VmState::Running;
                    self.persist(VmState::Running);
                    Ok(TimeoutAction::Done)
                } else {
                    Ok(TimeoutAction::Retry)
                }
            },
        )?;

        let delete_snapshot = {
            let inner = self.shared.lock();
            inner.delete_memory_snapshot
        };
        if delete_snapshot {
            debug!(target: "qvmctl", "{}: deleting memory snapshot", self.vm_name());
            if let Some(process) = self.current_process() {
                if let Err(err) = process.write_stdin(&qmp::hmc(&format!(
                    "delvm {}",
                    metadata::SUSPEND_TAG
                ))) {
                    warn!(target: "qvmctl", "{}: failed to send delvm: {:#}", self.vm_name(), err);
                }
            }
            self.shared.lock().delete_memory_snapshot = false;
        }

        Ok(())
    }

    fn current_process(&self) -> Option<Arc<dyn ProcessHandle>> {
        self.process
            .lock()
            .expect("poisoned process handle mutex")
            .clone()
    }

    fn persist(&self, state: VmState) {
        self.deps.monitor.persist_state_for(self.vm_name(), state);
    }
}

impl Drop for QemuVm {
    fn drop(&mut self) {
        self.shared.lock().update_shutdown_status = false;

        if self.current_state() == VmState::Running {
            self.suspend();
        } else {
            self.shutdown();
        }

        backend::remove_tap_device(&self.desc.tap_device_name);

        if let Some(process) = self.current_process() {
            process.wait_for_finished();
        }
        let pump = self.pump.lock().expect("poisoned pump mutex").take();
        if let Some(pump) = pump {
            let _ = pump.join();
        }
    }
}

/// Consumes the child's event stream and drives the state machine.
struct EventPump {
    shared: Arc<VmShared>,
    monitor: Arc<dyn StatusMonitor>,
    process: Arc<dyn ProcessHandle>,
}

impl EventPump {
    fn run(&self, events: mpsc::Receiver<ProcessEvent>) {
        for event in events {
            match event {
                ProcessEvent::StateChanged(state) => {
                    info!(target: "qvmctl", "{}: process state changed to {:?}", self.vm_name(), state);
                }
                ProcessEvent::Started => self.on_started(),
                ProcessEvent::Stdout(line) => self.on_qmp_output(&line),
                ProcessEvent::Stderr(line) => self.on_stderr(line),
                ProcessEvent::Error(message) => self.on_error(&message),
                ProcessEvent::Finished(exit) => self.on_finished(exit),
            }
        }
    }

    fn vm_name(&self) -> &str {
        &self.shared.vm_name
    }

    fn persist(&self, state: VmState) {
        self.monitor.persist_state_for(self.vm_name(), state);
    }

    fn on_started(&self) {
        info!(target: "qvmctl", "{}: process started", self.vm_name());
        let mut inner = self.shared.lock();
        inner.state = VmState::Starting;
        self.persist(VmState::Starting);
        drop(inner);
        self.shared.state_wait.notify_all();
        self.monitor.on_resume();
    }

    fn on_qmp_output(&self, line: &str) {
        debug!(target: "qvmctl", "{}: QMP: {}", self.vm_name(), line);
        match qmp::decode(line) {
            Some(QmpMessage::Event(event)) => self.on_qmp_event(event),
            Some(QmpMessage::Other(value)) => {
                debug!(target: "qvmctl", "{}: discarding QMP response: {}", self.vm_name(), value);
            }
            None => {}
        }
    }

    fn on_qmp_event(&self, event: QmpEvent) {
        match event {
            QmpEvent::Reset => {
                let mut inner = self.shared.lock();
                if inner.state != VmState::Restarting {
                    info!(target: "qvmctl", "{}: VM restarting", self.vm_name());
                    inner.state = VmState::Restarting;
                    self.persist(VmState::Restarting);
                    inner.ip = None;
                    drop(inner);
                    self.monitor.on_restart(self.vm_name());
                }
            }
            QmpEvent::Powerdown => {
                info!(target: "qvmctl", "{}: VM powering down", self.vm_name());
            }
            QmpEvent::Shutdown => {
                info!(target: "qvmctl", "{}: VM shut down", self.vm_name());
            }
            QmpEvent::Stop => {
                info!(target: "qvmctl", "{}: VM suspending", self.vm_name());
            }
            QmpEvent::Resume => {
                info!(target: "qvmctl", "{}: VM suspended", self.vm_name());
                let mut inner = self.shared.lock();
                if matches!(inner.state, VmState::Suspending | VmState::Running) {
                    self.process.kill();
                    inner.state = VmState::Suspended;
                    drop(inner);
                    self.monitor.on_suspend();
                }
            }
        }
    }

    fn on_stderr(&self, line: String) {
        warn!(target: "qvmctl", "{}: {}", self.vm_name(), line);
        self.shared.lock().saved_error_msg = line;
    }

    fn on_error(&self, message: &str) {
        let mut inner = self.shared.lock();
        // The child is killed on purpose when suspending; no error handling
        // for that path.
        if inner.update_shutdown_status {
            error!(target: "qvmctl", "{}: process error occurred: {}", self.vm_name(), message);
            inner.state = VmState::Off;
            self.persist(VmState::Off);
        }
    }

    fn on_finished(&self, exit: ExitStatusInfo) {
        info!(
            target: "qvmctl",
            "{}: process finished with {}",
            self.vm_name(),
            exit.describe()
        );
        let handle_shutdown = {
            let inner = self.shared.lock();
            inner.update_shutdown_status || inner.state == VmState::Starting
        };
        if handle_shutdown {
            self.on_shutdown();
        }
    }

    fn on_shutdown(&self) {
        let mut inner = self.shared.lock();
        if inner.state == VmState::Starting {
            warn!(target: "qvmctl", "{}: shutdown called while starting", self.vm_name());
            inner.saved_error_msg = format!("{}: shutdown called while starting", self.vm_name());
            while inner.state != VmState::Off {
                inner = self
                    .shared
                    .state_wait
                    .wait(inner)
                    .expect("poisoned vm state mutex");
            }
        } else {
            inner.state = VmState::Off;
        }
        inner.ip = None;
        let state = inner.state;
        self.persist(state);
        drop(inner);
        self.monitor.on_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmMetadataStore;
    use serde_json::{json, Value};
    use std::{
        collections::HashMap,
        fs,
        sync::atomic::{AtomicBool, Ordering},
    };
    use tempfile::TempDir;

    struct FakeProcess {
        started: AtomicBool,
        alive: AtomicBool,
        extra_args: Mutex<Vec<String>>,
        writes: Mutex<Vec<Vec<u8>>>,
        exit: Mutex<Option<ExitStatusInfo>>,
        reaped: Condvar,
        events: Mutex<Option<mpsc::Sender<ProcessEvent>>>,
    }

    impl FakeProcess {
        fn new(events: mpsc::Sender<ProcessEvent>) -> Self {
            Self {
                started: AtomicBool::new(false),
                alive: AtomicBool::new(false),
                extra_args: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                exit: Mutex::new(None),
                reaped: Condvar::new(),
                events: Mutex::new(Some(events)),
            }
        }

        fn emit(&self, event: ProcessEvent) {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                let _ = tx.send(event);
            }
        }

        fn emit_qmp_event(&self, name: &str) {
            self.emit(ProcessEvent::Stdout(format!(r#"{{"event": "{}"}}"#, name)));
        }

        /// Simulate the child exiting on its own.
        fn finish(&self, exit: ExitStatusInfo) {
            self.alive.store(false, Ordering::SeqCst);
            *self.exit.lock().unwrap() = Some(exit);
            self.reaped.notify_all();
            self.emit(ProcessEvent::Finished(exit));
            // Closing the channel ends the pump, as the real reader and
            // waiter threads do by dropping their senders.
            self.events.lock().unwrap().take();
        }

        fn written_text(&self) -> String {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                .collect()
        }

        fn recorded_extra_args(&self) -> Vec<String> {
            self.extra_args.lock().unwrap().clone()
        }
    }

    impl ProcessHandle for FakeProcess {
        fn start(&self, extra_args: &[String]) -> anyhow::Result<()> {
            *self.extra_args.lock().unwrap() = extra_args.to_vec();
            self.started.store(true, Ordering::SeqCst);
            self.alive.store(true, Ordering::SeqCst);
            self.emit(ProcessEvent::Started);
            Ok(())
        }

        fn write_stdin(&self, data: &[u8]) -> anyhow::Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn kill(&self) {
            if self.exit.lock().unwrap().is_some() {
                return;
            }
            self.emit(ProcessEvent::Error("process terminated by signal 9".into()));
            self.finish(ExitStatusInfo {
                code: None,
                signal: Some(libc::SIGKILL),
            });
        }

        fn running(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn wait_for_finished(&self) -> Option<ExitStatusInfo> {
            if !self.started.load(Ordering::SeqCst) {
                return None;
            }
            let mut exit = self.exit.lock().unwrap();
            while exit.is_none() {
                exit = self.reaped.wait(exit).unwrap();
            }
            *exit
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: Mutex<Vec<(Arc<FakeProcess>, QemuProcessSpec)>>,
    }

    impl FakeFactory {
        fn last(&self) -> Arc<FakeProcess> {
            Arc::clone(&self.created.lock().unwrap().last().expect("no process created").0)
        }

        fn last_spec(&self) -> QemuProcessSpec {
            self.created.lock().unwrap().last().expect("no process created").1.clone()
        }

        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    impl ProcessFactory for FakeFactory {
        fn create_process(
            &self,
            spec: &QemuProcessSpec,
        ) -> anyhow::Result<(Arc<dyn ProcessHandle>, mpsc::Receiver<ProcessEvent>)> {
            let (tx, rx) = mpsc::channel();
            let process = Arc::new(FakeProcess::new(tx));
            self.created
                .lock()
                .unwrap()
                .push((Arc::clone(&process), spec.clone()));
            Ok((process, rx))
        }
    }

    #[derive(Default)]
    struct RecordingMonitor {
        callbacks: Mutex<Vec<String>>,
        persisted: Mutex<Vec<VmState>>,
    }

    impl RecordingMonitor {
        fn callbacks(&self) -> Vec<String> {
            self.callbacks.lock().unwrap().clone()
        }

        fn persisted(&self) -> Vec<VmState> {
            self.persisted.lock().unwrap().clone()
        }

        fn saw(&self, callback: &str) -> bool {
            self.callbacks().iter().any(|c| c == callback)
        }
    }

    impl StatusMonitor for RecordingMonitor {
        fn on_resume(&self) {
            self.callbacks.lock().unwrap().push("resume".into());
        }

        fn on_restart(&self, vm_name: &str) {
            self.callbacks
                .lock()
                .unwrap()
                .push(format!("restart:{}", vm_name));
        }

        fn on_suspend(&self) {
            self.callbacks.lock().unwrap().push("suspend".into());
        }

        fn on_shutdown(&self) {
            self.callbacks.lock().unwrap().push("shutdown".into());
        }

        fn persist_state_for(&self, _vm_name: &str, state: VmState) {
            self.persisted.lock().unwrap().push(state);
        }
    }

    #[derive(Default)]
    struct MemoryMetadataStore {
        entries: Mutex<HashMap<String, Value>>,
    }

    impl VmMetadataStore for MemoryMetadataStore {
        fn retrieve_metadata_for(&self, vm_name: &str) -> Value {
            self.entries
                .lock()
                .unwrap()
                .get(vm_name)
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()))
        }

        fn update_metadata_for(&self, vm_name: &str, metadata: Value) {
            self.entries
                .lock()
                .unwrap()
                .insert(vm_name.to_string(), metadata);
        }
    }

    struct StaticDhcp(Option<Ipv4Addr>);

    impl DhcpDirectory for StaticDhcp {
        fn get_ip_for(&self, _mac_addr: &str) -> Option<Ipv4Addr> {
            self.0
        }
    }

    struct StaticSsh(bool);

    impl SshReachability for StaticSsh {
        fn can_connect(&self, _host: &str, _port: u16) -> bool {
            self.0
        }
    }

    struct Fixture {
        _temp: TempDir,
        vm: QemuVm,
        factory: Arc<FakeFactory>,
        monitor: Arc<RecordingMonitor>,
        metadata: Arc<MemoryMetadataStore>,
    }

    fn fixture(dhcp_ip: Option<Ipv4Addr>, ssh_reachable: bool) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let image = temp.path().join("disk.img");
        let cloud_init = temp.path().join("cloud-init.iso");
        fs::write(&image, b"image").unwrap();
        fs::write(&cloud_init, b"iso").unwrap();

        let factory = Arc::new(FakeFactory::default());
        let monitor = Arc::new(RecordingMonitor::default());
        let metadata = Arc::new(MemoryMetadataStore::default());

        let desc = VmDescriptor {
            vm_name: "primary".into(),
            image_path: image,
            cloud_init_path: cloud_init,
            tap_device_name: "tap-qvmctl-test".into(),
            mac_addr: "52:54:00:aa:bb:cc".into(),
            ssh_username: "ubuntu".into(),
            num_cores: 1,
            mem_size_mb: 1024,
        };
        let deps = VmDependencies {
            factory: Arc::clone(&factory) as Arc<dyn ProcessFactory>,
            dhcp: Arc::new(StaticDhcp(dhcp_ip)),
            monitor: Arc::clone(&monitor) as Arc<dyn StatusMonitor>,
            metadata: Arc::clone(&metadata) as Arc<dyn VmMetadataStore>,
            ssh: Arc::new(StaticSsh(ssh_reachable)),
        };
        let vm = QemuVm::new(desc, deps).unwrap();

        Fixture {
            _temp: temp,
            vm,
            factory,
            monitor,
            metadata,
        }
    }

    impl Fixture {
        fn force_state(&self, state: VmState) {
            self.vm.shared.lock().state = state;
        }

        /// Park the VM in a state from which Drop completes without help.
        fn settle(&self) {
            self.force_state(VmState::Off);
            for (process, _) in self.created() {
                process.kill();
            }
        }

        fn created(&self) -> Vec<(Arc<FakeProcess>, QemuProcessSpec)> {
            self.factory
                .created
                .lock()
                .unwrap()
                .iter()
                .map(|(p, s)| (Arc::clone(p), s.clone()))
                .collect()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn construction_requires_the_image_artefacts() {
        let temp = tempfile::tempdir().unwrap();
        let desc = VmDescriptor {
            vm_name: "primary".into(),
            image_path: temp.path().join("missing.img"),
            cloud_init_path: temp.path().join("missing.iso"),
            tap_device_name: "tap0".into(),
            mac_addr: "52:54:00:aa:bb:cc".into(),
            ssh_username: "ubuntu".into(),
            num_cores: 1,
            mem_size_mb: 1024,
        };
        let deps = VmDependencies {
            factory: Arc::new(FakeFactory::default()),
            dhcp: Arc::new(StaticDhcp(None)),
            monitor: Arc::new(RecordingMonitor::default()),
            metadata: Arc::new(MemoryMetadataStore::default()),
            ssh: Arc::new(StaticSsh(false)),
        };
        assert!(matches!(
            QemuVm::new(desc, deps),
            Err(VmError::MissingImage)
        ));
    }

    #[test]
    fn start_from_off_reaches_starting_and_notifies_the_monitor() {
        let f = fixture(None, false);
        assert_eq!(f.vm.current_state(), VmState::Off);

        f.vm.start().unwrap();

        assert_eq!(f.vm.current_state(), VmState::Starting);
        wait_until(|| f.monitor.saw("resume"));
        assert!(f.monitor.persisted().contains(&VmState::Starting));

        // Fresh starts persist regenerated metadata with the latest version.
        let meta = f.metadata.retrieve_metadata_for("primary");
        assert_eq!(meta["vm_command_version"], json!(metadata::LATEST_COMMAND_VERSION));

        // The QMP handshake goes out right after the child reports started.
        let process = f.factory.last();
        assert!(process.written_text().contains("qmp_capabilities"));
        assert!(process.recorded_extra_args().is_empty());

        f.settle();
    }

    #[test]
    fn start_while_running_is_a_noop() {
        let f = fixture(None, false);
        f.force_state(VmState::Running);
        f.vm.start().unwrap();
        assert_eq!(f.factory.created_count(), 0);
        f.settle();
    }

    #[test]
    fn start_while_suspending_fails() {
        let f = fixture(None, false);
        f.force_state(VmState::Suspending);
        let err = f.vm.start().unwrap_err();
        assert!(matches!(err, VmError::StartWhileSuspending));
        assert_eq!(
            err.to_string(),
            "cannot start the instance while suspending"
        );
        f.settle();
    }

    #[test]
    fn resume_start_appends_snapshot_arguments_and_honours_legacy_metadata() {
        let f = fixture(None, false);
        f.metadata.update_metadata_for(
            "primary",
            json!({ "use_cdrom": true, "machine_type": "pc-i440fx-bionic" }),
        );
        f.force_state(VmState::Suspended);

        f.vm.start().unwrap();

        let process = f.factory.last();
        let extra = process.recorded_extra_args();
        assert_eq!(
            extra,
            vec!["-loadvm", "suspend", "-machine", "pc-i440fx-bionic"]
        );

        // use_cdrom implies command version 1, so the base arguments carry
        // the cdrom form of the cloud-init attachment.
        let spec_args = f.factory.last_spec().arguments().to_vec();
        assert!(spec_args.iter().any(|a| a == "-cdrom"));

        {
            let inner = f.vm.shared.lock();
            assert!(inner.delete_memory_snapshot);
        }

        f.settle();
    }

    #[test]
    fn resume_start_defaults_the_machine_type() {
        let f = fixture(None, false);
        f.force_state(VmState::Suspended);

        f.vm.start().unwrap();

        let extra = f.factory.last().recorded_extra_args();
        assert_eq!(
            extra,
            vec!["-loadvm", "suspend", "-machine", metadata::DEFAULT_MACHINE_TYPE]
        );
        f.settle();
    }

    #[test]
    fn suspend_saves_memory_and_resume_event_completes_the_transition() {
        let f = fixture(None, false);
        f.vm.start().unwrap();
        f.force_state(VmState::Running);

        let vm = &f.vm;
        let process = f.factory.last();

        thread::scope(|scope| {
            let suspender = scope.spawn(|| vm.suspend());

            wait_until(|| vm.current_state() == VmState::Suspending || vm.current_state() == VmState::Suspended);
            assert!(process.written_text().contains("savevm suspend"));

            process.emit_qmp_event("RESUME");
            suspender.join().unwrap();
        });

        assert_eq!(f.vm.current_state(), VmState::Suspended);
        assert!(!process.running());
        wait_until(|| f.monitor.saw("suspend"));
        assert!(f.monitor.persisted().contains(&VmState::Suspending));

        f.settle();
    }

    #[test]
    fn suspend_while_off_only_notifies_the_monitor() {
        let f = fixture(None, false);
        f.vm.suspend();
        assert!(f.monitor.saw("suspend"));
        assert_eq!(f.vm.current_state(), VmState::Off);
        f.settle();
    }

    #[test]
    fn shutdown_of_a_running_vm_goes_through_system_powerdown() {
        let f = fixture(None, false);
        f.vm.start().unwrap();
        f.force_state(VmState::Running);

        let vm = &f.vm;
        let process = f.factory.last();

        thread::scope(|scope| {
            let stopper = scope.spawn(|| vm.shutdown());

            wait_until(|| process.written_text().contains("system_powerdown"));
            process.finish(ExitStatusInfo {
                code: Some(0),
                signal: None,
            });
            stopper.join().unwrap();
        });

        wait_until(|| f.monitor.saw("shutdown"));
        assert_eq!(f.vm.current_state(), VmState::Off);
        assert!(f.monitor.persisted().contains(&VmState::Off));
        f.settle();
    }

    #[test]
    fn shutdown_while_suspended_is_ignored() {
        let f = fixture(None, false);
        f.vm.start().unwrap();
        f.force_state(VmState::Suspended);

        f.vm.shutdown();

        let process = f.factory.last();
        assert!(process.running());
        assert!(!process.written_text().contains("system_powerdown"));
        f.settle();
    }

    #[test]
    fn reset_event_clears_the_address_and_enters_restarting() {
        let f = fixture(Some(Ipv4Addr::new(10, 122, 0, 5)), false);
        f.vm.start().unwrap();
        f.force_state(VmState::Running);
        assert_eq!(f.vm.ipv4(), "10.122.0.5");

        f.factory.last().emit_qmp_event("RESET");
        wait_until(|| f.vm.current_state() == VmState::Restarting);

        {
            let inner = f.vm.shared.lock();
            assert_eq!(inner.ip, None);
        }
        wait_until(|| f.monitor.saw("restart:primary"));
        assert!(f.monitor.persisted().contains(&VmState::Restarting));
        f.settle();
    }

    #[test]
    fn reset_event_while_already_restarting_is_ignored() {
        let f = fixture(None, false);
        f.vm.start().unwrap();
        f.force_state(VmState::Restarting);

        f.factory.last().emit_qmp_event("RESET");
        // Give the pump a moment; no second restart notification may appear.
        thread::sleep(Duration::from_millis(50));
        assert!(!f.monitor.saw("restart:primary"));
        f.settle();
    }

    #[test]
    fn error_event_turns_the_vm_off_when_uncontrolled() {
        let f = fixture(None, false);
        f.vm.start().unwrap();

        let process = f.factory.last();
        process.emit(ProcessEvent::Error("qemu blew up".into()));
        wait_until(|| f.vm.current_state() == VmState::Off);
        assert!(f.monitor.persisted().contains(&VmState::Off));
        f.settle();
    }

    #[test]
    fn child_death_while_starting_parks_shutdown_until_ensure_observes_it() {
        let f = fixture(None, false);
        f.vm.start().unwrap();
        assert_eq!(f.vm.current_state(), VmState::Starting);

        let process = f.factory.last();
        process.finish(ExitStatusInfo {
            code: Some(1),
            signal: None,
        });

        // The pump records the race and parks; the shutdown callback must
        // not have fired yet.
        wait_until(|| {
            f.vm.shared
                .lock()
                .saved_error_msg
                .contains("shutdown called while starting")
        });
        assert!(!f.monitor.saw("shutdown"));

        let err = f.vm.ensure_vm_is_running().unwrap_err();
        match err {
            VmError::Start { vm_name, message } => {
                assert_eq!(vm_name, "primary");
                assert!(message.contains("shutdown called while starting"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        wait_until(|| f.monitor.saw("shutdown"));
        assert_eq!(f.vm.current_state(), VmState::Off);
        assert!(f.monitor.persisted().contains(&VmState::Off));
        f.settle();
    }

    #[test]
    fn wait_until_ssh_up_marks_running_and_deletes_the_memory_snapshot() {
        let f = fixture(Some(Ipv4Addr::new(10, 122, 0, 7)), true);
        f.vm.start().unwrap();
        f.force_state(VmState::Running);
        f.vm.shared.lock().delete_memory_snapshot = true;

        f.vm.wait_until_ssh_up(Duration::from_secs(5)).unwrap();

        assert_eq!(f.vm.current_state(), VmState::Running);
        assert!(f.monitor.persisted().contains(&VmState::Running));
        let process = f.factory.last();
        assert!(process.written_text().contains("delvm suspend"));
        {
            let inner = f.vm.shared.lock();
            assert!(!inner.delete_memory_snapshot);
        }
        f.settle();
    }

    #[test]
    fn wait_until_ssh_up_times_out_into_unknown() {
        let f = fixture(Some(Ipv4Addr::new(10, 122, 0, 7)), false);
        f.vm.start().unwrap();

        let err = f.vm.wait_until_ssh_up(Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.to_string(), "primary: timed out waiting for response");
        assert_eq!(f.vm.current_state(), VmState::Unknown);
        assert!(f.monitor.persisted().contains(&VmState::Unknown));
        f.settle();
    }

    #[test]
    fn ssh_hostname_caches_the_discovered_address() {
        let f = fixture(Some(Ipv4Addr::new(10, 122, 0, 9)), false);
        f.vm.start().unwrap();

        assert_eq!(f.vm.ssh_hostname().unwrap(), "10.122.0.9");
        // Cached: answered without consulting liveness again.
        assert_eq!(f.vm.ssh_hostname().unwrap(), "10.122.0.9");
        f.settle();
    }

    #[test]
    fn ssh_hostname_times_out_without_an_address() {
        let f = fixture(None, false);
        f.vm.start().unwrap();

        let err = f.vm.ssh_hostname_within(Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.to_string(), "failed to determine IP address");
        f.settle();
    }

    #[test]
    fn ssh_hostname_surfaces_the_start_failure_of_a_dead_child() {
        let f = fixture(Some(Ipv4Addr::new(10, 122, 0, 9)), false);
        f.vm.start().unwrap();
        f.force_state(VmState::Running);

        let process = f.factory.last();
        process.emit(ProcessEvent::Stderr("kvm: host does not support KVM".into()));
        wait_until(|| !f.vm.shared.lock().saved_error_msg.is_empty());
        process.finish(ExitStatusInfo {
            code: Some(1),
            signal: None,
        });
        wait_until(|| !process.running());

        // The cached address is absent, so discovery runs and trips over
        // the dead child.
        match f.vm.ssh_hostname() {
            Err(VmError::Start { message, .. }) => {
                assert!(message.contains("KVM"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        f.settle();
    }

    #[test]
    fn ipv4_reports_unknown_without_a_lease() {
        let f = fixture(None, false);
        assert_eq!(f.vm.ipv4(), "UNKNOWN");
        f.settle();
    }

    #[test]
    fn fixed_ssh_facts() {
        let f = fixture(None, false);
        assert_eq!(f.vm.ssh_port(), 22);
        assert_eq!(f.vm.ssh_username(), "ubuntu");
        assert_eq!(f.vm.ipv6(), "");
        f.settle();
    }

    #[test]
    fn running_is_never_entered_without_a_prior_starting() {
        let f = fixture(Some(Ipv4Addr::new(10, 122, 0, 2)), true);

        f.vm.start().unwrap();
        f.vm.wait_until_ssh_up(Duration::from_secs(5)).unwrap();

        let persisted = f.monitor.persisted();
        let starting = persisted
            .iter()
            .position(|s| *s == VmState::Starting)
            .expect("starting persisted");
        let running = persisted
            .iter()
            .position(|s| *s == VmState::Running)
            .expect("running persisted");
        assert!(starting < running);
        f.settle();
    }
}

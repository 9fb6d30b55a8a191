//! In-memory fakes for tests of this crate and of capability backends.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_model::{
    ContainerMetrics, GpuDevice, GpuId, GpuVendor, Mount, NetworkSpec, Resources, TaskDescriptor,
    TaskId, Timestamp,
};
use tokio::sync::mpsc;

use crate::action::Action;
use crate::cleanup::{Cleanup, NoopCleanup};
use crate::config::OverseerConfig;
use crate::error::{CoreError, RuntimeError};
use crate::launcher::ResourceAccountant;
use crate::overseer::{ContainerHandle, Overseer, commit_reference};
use crate::runtime::*;
use crate::tune::{GpuTuner, NetworkTuner, Repository, Volume, VolumeDriver};

/// Shared ordered log of side effects.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Polls `cond` until it holds; panics after a minute of (possibly virtual) time.
pub async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

pub fn die(id: &str, nanos: u64) -> RuntimeEvent {
    RuntimeEvent {
        id: id.to_string(),
        action: EventAction::Die,
        time: Timestamp::from_nanos(nanos),
        attributes: Default::default(),
    }
}

pub struct CountingCleanup {
    name: String,
    journal: Journal,
    count: AtomicUsize,
    fail: bool,
}

impl CountingCleanup {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            count: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing(name: &str, journal: &Journal) -> Self {
        Self {
            fail: true,
            ..Self::new(name, journal)
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cleanup for CountingCleanup {
    async fn close(&self) -> Result<(), CoreError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.journal.push(format!("close:{}", self.name));
        if self.fail {
            return Err(CoreError::Driver(format!("{} failed", self.name)));
        }
        Ok(())
    }
}

/// Appends a fixed entry to the journal when closed.
struct JournalCleanup {
    entry: String,
    journal: Journal,
}

#[async_trait]
impl Cleanup for JournalCleanup {
    async fn close(&self) -> Result<(), CoreError> {
        self.journal.push(self.entry.clone());
        Ok(())
    }
}

pub struct RecordingAction {
    name: String,
    journal: Journal,
    fail_execute: bool,
    fail_rollback: bool,
}

impl RecordingAction {
    fn make(name: &str, journal: &Journal, fail_execute: bool, fail_rollback: bool) -> Box<dyn Action> {
        Box::new(Self {
            name: name.to_string(),
            journal: journal.clone(),
            fail_execute,
            fail_rollback,
        })
    }

    pub fn boxed(name: &str, journal: &Journal) -> Box<dyn Action> {
        Self::make(name, journal, false, false)
    }

    pub fn failing(name: &str, journal: &Journal) -> Box<dyn Action> {
        Self::make(name, journal, true, false)
    }

    pub fn failing_rollback(name: &str, journal: &Journal) -> Box<dyn Action> {
        Self::make(name, journal, false, true)
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) -> Result<(), CoreError> {
        self.journal.push(format!("execute:{}", self.name));
        if self.fail_execute {
            return Err(CoreError::Driver(format!("{} failed", self.name)));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), CoreError> {
        self.journal.push(format!("rollback:{}", self.name));
        if self.fail_rollback {
            return Err(CoreError::Driver(format!("{} rollback failed", self.name)));
        }
        Ok(())
    }
}

pub struct FakeGpuTuner {
    devices: Vec<GpuDevice>,
}

impl FakeGpuTuner {
    pub fn new(ids: &[&str]) -> Self {
        let devices = ids
            .iter()
            .map(|id| GpuDevice {
                id: GpuId::from(*id),
                vendor: GpuVendor::Fake,
                name: String::new(),
                device_files: vec![format!("/dev/fake/{id}")],
            })
            .collect();
        Self { devices }
    }
}

impl GpuTuner for FakeGpuTuner {
    fn devices(&self) -> Vec<GpuDevice> {
        self.devices.clone()
    }

    fn tune(&self, host: &mut HostConfig, ids: &[GpuId]) -> Result<(), CoreError> {
        for id in ids {
            let device = self
                .devices
                .iter()
                .find(|d| &d.id == id)
                .ok_or_else(|| CoreError::Unavailable(id.to_string()))?;
            host.devices
                .extend(device.device_files.iter().map(DeviceMapping::passthrough));
        }
        Ok(())
    }
}

pub struct FakeVolumeDriver {
    journal: Journal,
    fail_on: Option<String>,
}

impl FakeVolumeDriver {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail_on: None,
        }
    }

    /// Refuses to create the volume called `name`.
    pub fn failing_on(journal: &Journal, name: &str) -> Self {
        Self {
            fail_on: Some(name.to_string()),
            ..Self::new(journal)
        }
    }
}

struct FakeVolume;

impl Volume for FakeVolume {
    fn configure(&self, mount: &Mount, host: &mut HostConfig) -> Result<(), CoreError> {
        host.mounts.push(MountConfig {
            kind: MountKind::Volume,
            source: mount.source.clone(),
            target: mount.target.clone(),
            read_only: mount.is_read_only(),
            driver: Some("fake".to_string()),
            driver_options: Default::default(),
        });
        Ok(())
    }
}

#[async_trait]
impl VolumeDriver for FakeVolumeDriver {
    async fn create_volume(
        &self,
        name: &str,
        _settings: &std::collections::BTreeMap<String, String>,
    ) -> Result<Box<dyn Volume>, CoreError> {
        self.journal.push(format!("volume.create:{name}"));
        if self.fail_on.as_deref() == Some(name) {
            return Err(CoreError::Driver(format!("cannot create {name}")));
        }
        Ok(Box::new(FakeVolume))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), CoreError> {
        self.journal.push(format!("volume.remove:{name}"));
        Ok(())
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.journal.push("volume.close");
        Ok(())
    }
}

pub struct FakeNetworkTuner {
    journal: Journal,
    fail: Fail,
}

enum Fail {
    Never,
    Always,
    On(String),
}

impl FakeNetworkTuner {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail: Fail::Never,
        }
    }

    pub fn failing(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail: Fail::Always,
        }
    }

    /// Fails to attach network `net_id` only.
    pub fn failing_on(journal: &Journal, net_id: &str) -> Self {
        Self {
            journal: journal.clone(),
            fail: Fail::On(net_id.to_string()),
        }
    }

    fn remover(&self, net_id: &str) -> Box<dyn Cleanup> {
        Box::new(JournalCleanup {
            entry: format!("network.remove:{net_id}"),
            journal: self.journal.clone(),
        })
    }
}

#[async_trait]
impl NetworkTuner for FakeNetworkTuner {
    async fn tune(
        &self,
        spec: &NetworkSpec,
        _host: &mut HostConfig,
        net: &mut NetworkingConfig,
    ) -> Result<Box<dyn Cleanup>, CoreError> {
        self.journal.push(format!("network.tune:{}", spec.net_id));
        let fail = match &self.fail {
            Fail::Never => false,
            Fail::Always => true,
            Fail::On(net_id) => *net_id == spec.net_id,
        };
        if fail {
            return Err(CoreError::Unavailable(format!("{} is down", spec.net_id)));
        }
        net.endpoints.insert(
            spec.net_id.clone(),
            EndpointSettings {
                network_id: spec.net_id.clone(),
                ..Default::default()
            },
        );
        Ok(self.remover(&spec.net_id))
    }

    async fn cleaner(&self, net_id: &str) -> Result<Box<dyn Cleanup>, CoreError> {
        Ok(self.remover(net_id))
    }
}

pub struct FakeAccountant {
    journal: Journal,
    exhausted: bool,
}

impl FakeAccountant {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            exhausted: false,
        }
    }

    pub fn exhausted(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            exhausted: true,
        }
    }
}

#[async_trait]
impl ResourceAccountant for FakeAccountant {
    async fn consume_task(&self, plan_id: &str, task_id: &TaskId, _resources: &Resources) -> Result<(), CoreError> {
        if self.exhausted {
            return Err(CoreError::Unavailable("no capacity left".into()));
        }
        self.journal.push(format!("consume:{plan_id}:{task_id}"));
        Ok(())
    }

    async fn release_task(&self, task_id: &TaskId) {
        self.journal.push(format!("release:{task_id}"));
    }
}

/// Scripted outcome of one `events` subscription.
pub enum Script {
    /// The subscription itself is refused.
    Fail(RuntimeError),
    /// The stream yields `events`, then ends with `then` or by closing.
    Events {
        events: Vec<RuntimeEvent>,
        then: Option<RuntimeError>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub since: Timestamp,
    pub at: tokio::time::Instant,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    failures: HashMap<String, u32>,
    images: Vec<ImageSummary>,
    next_id: u32,
    created: HashSet<String>,
    running: HashSet<String>,
    specs: Vec<ContainerCreate>,
    scripts: VecDeque<Script>,
    subscriptions: Vec<Subscription>,
    live: Option<mpsc::Sender<Result<RuntimeEvent, RuntimeError>>>,
    delays: HashMap<String, Duration>,
    die_on_kill: bool,
}

/// Container engine kept entirely in memory.
///
/// Container ids are `c1`, `c2`, ...; a commit of `cN` yields image `image-cN`.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

const PERMANENT: u32 = u32::MAX;

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Makes every call of `op` fail.
    pub fn fail(&self, op: &str) {
        self.state().failures.insert(op.to_string(), PERMANENT);
    }

    pub fn fail_once(&self, op: &str) {
        self.state().failures.insert(op.to_string(), 1);
    }

    /// Makes every call of `op` take `delay` before answering.
    pub fn delay(&self, op: &str, delay: Duration) {
        self.state().delays.insert(op.to_string(), delay);
    }

    /// Emits a `die` event on the open subscription whenever a container is killed,
    /// like a real engine does.
    pub fn die_on_kill(&self) {
        self.state().die_on_kill = true;
    }

    pub fn add_image(&self, reference: &str) {
        self.state().images.push(ImageSummary {
            id: format!("sha256:{reference}"),
            repo_tags: vec![reference.to_string()],
        });
    }

    /// Pretends a container was started by an earlier process.
    pub fn add_running(&self, id: &str) {
        let mut state = self.state();
        state.created.insert(id.to_string());
        state.running.insert(id.to_string());
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state().running.contains(id)
    }

    pub fn script(&self, script: Script) {
        self.state().scripts.push_back(script);
    }

    /// Sends an event on the currently open subscription.
    pub fn emit(&self, event: RuntimeEvent) -> bool {
        let live = self.state().live.clone();
        live.is_some_and(|tx| tx.try_send(Ok(event)).is_ok())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn specs(&self) -> Vec<ContainerCreate> {
        self.state().specs.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state().subscriptions.clone()
    }

    async fn slow_call(&self, op: &str, record: String) -> Result<(), RuntimeError> {
        let delay = self.state().delays.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.call(op, record)
    }

    fn call(&self, op: &str, record: String) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(record);
        match state.failures.get_mut(op) {
            Some(n) if *n > 0 => {
                if *n != PERMANENT {
                    *n -= 1;
                }
                Err(RuntimeError::Engine(format!("{op} failed")))
            }
            _ => Ok(()),
        }
    }

    fn known(&self, id: &str) -> Result<(), RuntimeError> {
        if self.state().created.contains(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_list(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        self.call("images", "images".into())?;
        Ok(self.state().images.clone())
    }

    async fn image_pull(&self, reference: &str, _auth: Option<&str>) -> Result<(), RuntimeError> {
        self.call("pull", format!("pull:{reference}"))?;
        self.add_image(reference);
        Ok(())
    }

    async fn image_load(&self, _archive: ByteStream) -> Result<String, RuntimeError> {
        self.call("load", "load".into())?;
        Ok("sha256:loaded".into())
    }

    async fn image_save(&self, image: &str) -> Result<(ImageInspect, ByteStream), RuntimeError> {
        self.call("save", format!("save:{image}"))?;
        let inspect = ImageInspect {
            id: image.to_string(),
            size: 4,
            repo_tags: Vec::new(),
        };
        Ok((inspect, Box::new(std::io::Cursor::new(b"tar!".to_vec()))))
    }

    async fn image_tag(&self, image: &str, reference: &str) -> Result<(), RuntimeError> {
        self.call("tag", format!("tag:{image}:{reference}"))
    }

    async fn image_push(&self, reference: &str, _auth: Option<&str>) -> Result<(), RuntimeError> {
        self.call("push", format!("push:{reference}"))
    }

    async fn image_remove(&self, image: &str) -> Result<(), RuntimeError> {
        self.call("rmi", format!("rmi:{image}"))
    }

    async fn container_create(&self, spec: &ContainerCreate) -> Result<CreateResponse, RuntimeError> {
        self.call("create", format!("create:{}", spec.config.image))?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.created.insert(id.clone());
        state.specs.push(spec.clone());
        Ok(CreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn container_start(&self, id: &str) -> Result<(), RuntimeError> {
        self.call("start", format!("start:{id}"))?;
        self.known(id)?;
        self.state().running.insert(id.to_string());
        Ok(())
    }

    async fn container_inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        self.call("inspect", format!("inspect:{id}"))?;
        self.known(id)?;
        Ok(ContainerState {
            running: self.is_running(id),
            exit_code: None,
        })
    }

    async fn container_kill(&self, id: &str, _signal: &str) -> Result<(), RuntimeError> {
        self.call("kill", format!("kill:{id}"))?;
        let die_on_kill = {
            let mut state = self.state();
            state.running.remove(id);
            state.die_on_kill
        };
        if die_on_kill {
            self.emit(die(id, Timestamp::now().as_nanos()));
        }
        Ok(())
    }

    async fn container_remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.call("remove", format!("remove:{id}"))?;
        let mut state = self.state();
        state.running.remove(id);
        state.created.remove(id);
        Ok(())
    }

    async fn container_commit(&self, id: &str) -> Result<String, RuntimeError> {
        self.slow_call("commit", format!("commit:{id}")).await?;
        Ok(format!("image-{id}"))
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerMetrics, RuntimeError> {
        self.call("stats", format!("stats:{id}"))?;
        Ok(ContainerMetrics {
            memory_usage: 1024,
            collected_at: Timestamp::now(),
            ..Default::default()
        })
    }

    async fn container_logs(&self, id: &str, _opts: &LogsOptions) -> Result<ByteStream, RuntimeError> {
        self.call("logs", format!("logs:{id}"))?;
        Ok(Box::new(std::io::Cursor::new(format!("{id} says hi\n").into_bytes())))
    }

    async fn container_exec(&self, id: &str, _cfg: &ExecConfig) -> Result<ExecSession, RuntimeError> {
        self.call("exec", format!("exec:{id}"))?;
        let (ours, _theirs) = tokio::io::duplex(64);
        Ok(Box::new(ours))
    }

    async fn network_create(&self, spec: &NetworkCreate) -> Result<String, RuntimeError> {
        self.call("network.create", format!("network.create:{}", spec.name))?;
        Ok(format!("net-{}", spec.name))
    }

    async fn network_remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.call("network.remove", format!("network.remove:{id}"))
    }

    async fn events(&self, filter: &EventFilter) -> Result<EventStream, RuntimeError> {
        let mut state = self.state();
        state.subscriptions.push(Subscription {
            since: filter.since,
            at: tokio::time::Instant::now(),
        });

        let (tx, rx) = mpsc::channel(64);
        match state.scripts.pop_front() {
            Some(Script::Fail(e)) => return Err(e),
            Some(Script::Events { events, then }) => {
                for event in events {
                    let _ = tx.try_send(Ok(event));
                }
                if let Some(e) = then {
                    let _ = tx.try_send(Err(e));
                }
                state.live = None;
            }
            None => state.live = Some(tx),
        }
        Ok(rx)
    }
}

pub fn handle_for(runtime: &Arc<FakeRuntime>, id: &str, descriptor: TaskDescriptor) -> Arc<ContainerHandle> {
    handle_with(runtime, id, descriptor, Box::new(NoopCleanup))
}

pub fn handle(runtime: &Arc<FakeRuntime>, id: &str) -> Arc<ContainerHandle> {
    handle_for(runtime, id, TaskDescriptor::builder(format!("task-{id}"), "app:1").build())
}

pub fn handle_with_cleanup(
    runtime: &Arc<FakeRuntime>,
    id: &str,
    cleanup: Arc<CountingCleanup>,
) -> Arc<ContainerHandle> {
    let descriptor = TaskDescriptor::builder(format!("task-{id}"), "app:1").build();
    handle_with(runtime, id, descriptor, Box::new(cleanup))
}

fn handle_with(
    runtime: &Arc<FakeRuntime>,
    id: &str,
    descriptor: TaskDescriptor,
    cleanup: Box<dyn Cleanup>,
) -> Arc<ContainerHandle> {
    let reference = commit_reference("", &descriptor);
    Arc::new(ContainerHandle::new(
        id.to_string(),
        Arc::new(descriptor),
        runtime.clone(),
        cleanup,
        reference,
    ))
}

pub fn overseer(runtime: &Arc<FakeRuntime>, plugins: Repository) -> Overseer {
    Overseer::new(runtime.clone(), Arc::new(plugins), OverseerConfig::default())
        .expect("default config is valid")
}

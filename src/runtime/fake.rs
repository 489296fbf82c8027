//! In-memory runtime used by the orchestrator tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    Connector, ContainerReport, OutputChunk, OutputStream, RemoteState, RuntimeClient,
    RuntimeError, RuntimeResult,
};
use crate::config::ServerConfig;
use crate::types::{BuildId, ContainerId, HostName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Build(String),
    RemoveImage(BuildId),
    Create { image: BuildId, name: String },
    Start(ContainerId),
    Stop(ContainerId),
    RemoveContainer(ContainerId),
    Inspect(ContainerId),
    Attach(ContainerId),
    Close,
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Build,
    Create,
    Start,
    Stop,
    Inspect,
    Attach,
    /// Attach succeeds but the output stream ends in an error.
    Stream,
    RemoveContainer,
}

pub struct FakeRuntime {
    host: String,
    counter: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<Op>>,
    reports: Mutex<HashMap<ContainerId, ContainerReport>>,
    output: Mutex<Vec<OutputChunk>>,
    build_delay: Mutex<Duration>,
}

impl FakeRuntime {
    pub fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            counter: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            reports: Mutex::new(HashMap::new()),
            output: Mutex::new(Vec::new()),
            build_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn fail(&self, op: Op) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: Op) {
        self.failing.lock().unwrap().remove(&op);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = delay;
    }

    /// Output replayed to every attach.
    pub fn set_output(&self, chunks: Vec<OutputChunk>) {
        *self.output.lock().unwrap() = chunks;
    }

    /// Make the container report as exited at `at`.
    pub fn set_exited(&self, id: &ContainerId, at: DateTime<Utc>) {
        let mut reports = self.reports.lock().unwrap();
        let report = reports.entry(id.clone()).or_insert_with(running_report);
        report.state = RemoteState::Exited;
        report.finished_at = Some(at);
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    /// Container names in creation order.
    pub fn created(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Create { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, op: Op, operation: &'static str) -> RuntimeResult<()> {
        if self.failing.lock().unwrap().contains(&op) {
            return Err(RuntimeError::operation(operation, "injected failure"));
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}-{}", self.host, prefix, n)
    }
}

fn running_report() -> ContainerReport {
    ContainerReport {
        state: RemoteState::Running,
        started_at: Some(Utc::now()),
        finished_at: None,
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn build_image(&self, name: &str, _context_dir: &Path) -> RuntimeResult<BuildId> {
        self.record(Call::Build(name.to_string()));
        let delay = *self.build_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(Op::Build, "build_image")?;
        Ok(BuildId::new(self.next_id("img")))
    }

    async fn remove_image(&self, id: &BuildId) -> RuntimeResult<()> {
        self.record(Call::RemoveImage(id.clone()));
        Ok(())
    }

    async fn create_container(&self, image: &BuildId, name: &str) -> RuntimeResult<ContainerId> {
        self.record(Call::Create {
            image: image.clone(),
            name: name.to_string(),
        });
        self.check(Op::Create, "create_container")?;
        let id = ContainerId::new(self.next_id("ctr"));
        self.reports
            .lock()
            .unwrap()
            .insert(id.clone(), running_report());
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        self.record(Call::Start(id.clone()));
        self.check(Op::Start, "start_container")
    }

    async fn stop_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        self.record(Call::Stop(id.clone()));
        self.check(Op::Stop, "stop_container")
    }

    async fn remove_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        self.record(Call::RemoveContainer(id.clone()));
        self.check(Op::RemoveContainer, "remove_container")?;
        match self.reports.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn inspect_container(&self, id: &ContainerId) -> RuntimeResult<ContainerReport> {
        self.record(Call::Inspect(id.clone()));
        self.check(Op::Inspect, "inspect_container")?;
        self.reports
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn attach_container(&self, id: &ContainerId) -> RuntimeResult<OutputStream> {
        self.record(Call::Attach(id.clone()));
        self.check(Op::Attach, "attach_container")?;
        let mut chunks: Vec<RuntimeResult<OutputChunk>> =
            self.output.lock().unwrap().iter().cloned().map(Ok).collect();
        if self.check(Op::Stream, "attach_container").is_err() {
            chunks.push(Err(RuntimeError::operation(
                "attach_container",
                "session dropped",
            )));
        }
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn close(&self) {
        self.record(Call::Close);
    }
}

/// Hands out pre-registered fakes by host name.
#[derive(Default)]
pub struct FakeConnector {
    runtimes: HashMap<String, Arc<FakeRuntime>>,
}

impl FakeConnector {
    pub fn with_hosts(hosts: &[&str]) -> Self {
        Self {
            runtimes: hosts
                .iter()
                .map(|h| (h.to_string(), FakeRuntime::new(h)))
                .collect(),
        }
    }

    pub fn runtime(&self, host: &str) -> Arc<FakeRuntime> {
        self.runtimes[host].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        host: &HostName,
        _server: &ServerConfig,
    ) -> RuntimeResult<Arc<dyn RuntimeClient>> {
        match self.runtimes.get(host.as_str()) {
            Some(runtime) => Ok(runtime.clone() as Arc<dyn RuntimeClient>),
            None => Err(RuntimeError::Connect(format!("no route to {host}"))),
        }
    }
}

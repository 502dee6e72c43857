//! Test doubles for the command runner and backends.

use async_trait::async_trait;
use repokit_core::{
    Backend, ConnectionData, Error, Instance, InstanceHandle, ProvisionRequest, Result,
};
use repokit_executor::process::{CommandOutput, CommandRunner, Invocation};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Records invocations and replays queued outputs; succeeds silently once the queue is empty.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    responses: Mutex<VecDeque<CommandOutput>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, output: CommandOutput) {
        self.responses.lock().unwrap().push_back(output);
    }

    pub fn fail_next(&self, code: i32, stderr: &str) {
        self.respond(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CommandOutput {
                code: Some(0),
                ..Default::default()
            }))
    }
}

/// In-memory backend that reports ready after a fixed number of probes.
pub struct FakeBackend {
    pub not_ready_probes: usize,
    pub fail_provision: bool,
    pub probes: AtomicUsize,
    pub torn_down: Mutex<Vec<InstanceHandle>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            not_ready_probes: 0,
            fail_provision: false,
            probes: AtomicUsize::new(0),
            torn_down: Mutex::new(Vec::new()),
        }
    }

    pub fn torn_down(&self) -> Vec<InstanceHandle> {
        self.torn_down.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Instance> {
        if self.fail_provision {
            return Err(Error::ContainerFailed("image build failed".to_string()));
        }
        let port = request.port.unwrap_or(40001);
        Ok(Instance {
            connection: ConnectionData::new(
                "localhost",
                port,
                request.dbname(),
                request.user(),
                request.password.clone().or_else(|| Some("generated".to_string())),
            ),
            handle: InstanceHandle::new("fake", format!("{}_{}", request.dbname(), port)),
        })
    }

    async fn probe_ready(&self, _instance: &Instance) -> Result<bool> {
        let seen = self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(seen >= self.not_ready_probes)
    }

    async fn teardown(&self, handle: &InstanceHandle) -> Result<()> {
        let mut torn_down = self.torn_down.lock().unwrap();
        if torn_down.contains(handle) {
            return Err(Error::InstanceNotFound(handle.instance_id.clone()));
        }
        torn_down.push(handle.clone());
        Ok(())
    }
}

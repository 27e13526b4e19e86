//! Shared test doubles.
//!
//! - [`FakeEngine`]: in-memory container engine with call bookkeeping and
//!   injectable failures.
//! - [`FakeRunner`]: scripted control binaries keyed by command-line prefix.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use taskbox::engine::{ByteStream, StatsStream, StdinSocket};
use taskbox::{
    CommandOutput, CommandRunner, ContainerConfig, ContainerEngine, ContainerInspection,
    EngineState, Error, OutputStream, Result, RuntimeTunables, StatsSample,
};
use tokio::io::AsyncWrite;

/// Installs a test-writer subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Tunables small enough for tests to observe the poll loop quickly.
pub fn fast_tunables() -> RuntimeTunables {
    RuntimeTunables {
        poll_interval: Duration::from_millis(10),
        join_timeout: Duration::from_secs(1),
    }
}

// =============================================================================
// Fake Engine
// =============================================================================

fn is_running(running: &Mutex<HashSet<String>>, id: &str) -> bool {
    running.lock().unwrap().contains(id)
}

struct FakeContainer {
    config: ContainerConfig,
    state: EngineState,
    exit_code: Option<i64>,
}

#[derive(Default)]
struct Book {
    next_id: u32,
    containers: HashMap<String, FakeContainer>,
    created: Vec<ContainerConfig>,
    calls: Vec<String>,
    failing: HashSet<String>,
    images: HashSet<String>,
    volumes: Vec<(String, String, HashMap<String, String>)>,
    stats: Vec<StatsSample>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    log_follows: Vec<bool>,
}

/// In-memory [`ContainerEngine`].
///
/// Containers run until [`FakeEngine::exit`] or `stop_container` is called;
/// a stopped container reports exit code 137. A followed log stream stays
/// open while its container runs.
#[derive(Default)]
pub struct FakeEngine {
    book: Mutex<Book>,
    running: Arc<Mutex<HashSet<String>>>,
    stdin_data: Arc<Mutex<Vec<u8>>>,
    stdin_shutdowns: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.book.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn set_output(&self, stdout: &[u8], stderr: &[u8]) {
        let mut book = self.book.lock().unwrap();
        book.stdout = stdout.to_vec();
        book.stderr = stderr.to_vec();
    }

    /// Samples delivered by `stats`, a few milliseconds apart.
    pub fn set_stats(&self, samples: Vec<StatsSample>) {
        self.book.lock().unwrap().stats = samples;
    }

    pub fn add_image(&self, image: &str) {
        self.book.lock().unwrap().images.insert(image.to_string());
    }

    /// Lets the main process of `id` exit with `code`.
    pub fn exit(&self, id: &str, code: i64) {
        let mut book = self.book.lock().unwrap();
        if let Some(container) = book.containers.get_mut(id) {
            container.state = EngineState::Exited;
            container.exit_code = Some(code);
        }
        self.running.lock().unwrap().remove(id);
    }

    /// `follow` flag of every `logs` call, in order.
    pub fn log_follows(&self) -> Vec<bool> {
        self.book.lock().unwrap().log_follows.clone()
    }

    /// Number of calls of `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.book
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == op)
            .count()
    }

    /// Total number of engine calls.
    pub fn total_calls(&self) -> usize {
        self.book.lock().unwrap().calls.len()
    }

    pub fn created(&self) -> Vec<ContainerConfig> {
        self.book.lock().unwrap().created.clone()
    }

    pub fn live_containers(&self) -> usize {
        self.book.lock().unwrap().containers.len()
    }

    pub fn volumes(&self) -> Vec<(String, String, HashMap<String, String>)> {
        self.book.lock().unwrap().volumes.clone()
    }

    pub fn stdin_data(&self) -> Vec<u8> {
        self.stdin_data.lock().unwrap().clone()
    }

    pub fn stdin_shutdowns(&self) -> usize {
        self.stdin_shutdowns.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str) -> Result<()> {
        let mut book = self.book.lock().unwrap();
        book.calls.push(op.to_string());
        if book.failing.contains(op) {
            Err(Error::engine(op, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T> {
        let mut book = self.book.lock().unwrap();
        book.containers
            .get_mut(id)
            .map(f)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        self.record("create")?;
        let mut book = self.book.lock().unwrap();
        book.next_id += 1;
        let id = format!("c{:04}", book.next_id);
        book.created.push(config.clone());
        book.containers.insert(
            id.clone(),
            FakeContainer {
                config: config.clone(),
                state: EngineState::Created,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record("start")?;
        self.with_container(id, |c| c.state = EngineState::Running)?;
        self.running.lock().unwrap().insert(id.to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.record("stop")?;
        self.with_container(id, |c| {
            if c.state == EngineState::Running {
                c.state = EngineState::Exited;
                c.exit_code = Some(137);
            }
        })?;
        self.running.lock().unwrap().remove(id);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record("remove")?;
        self.running.lock().unwrap().remove(id);
        self.book
            .lock()
            .unwrap()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspection> {
        self.record("inspect")?;
        self.with_container(id, |c| ContainerInspection {
            state: c.state,
            exit_code: c.exit_code,
            ports: c
                .config
                .host
                .published_ports
                .iter()
                .map(|&port| (port, 40000 + port))
                .collect(),
        })
    }

    async fn stats(&self, _id: &str) -> Result<StatsStream> {
        self.record("stats")?;
        let samples = self.book.lock().unwrap().stats.clone();
        Ok(stream::iter(samples)
            .then(|sample| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(sample)
            })
            .chain(stream::pending())
            .boxed())
    }

    async fn attach_stdin(&self, _id: &str) -> Result<StdinSocket> {
        self.record("attach")?;
        Ok(Box::pin(FakeSocket {
            data: Arc::clone(&self.stdin_data),
            shutdowns: Arc::clone(&self.stdin_shutdowns),
        }))
    }

    async fn logs(&self, id: &str, stream: OutputStream, follow: bool) -> Result<ByteStream> {
        self.record("logs")?;
        let data = {
            let mut book = self.book.lock().unwrap();
            book.log_follows.push(follow);
            match stream {
                OutputStream::Stdout => book.stdout.clone(),
                OutputStream::Stderr => book.stderr.clone(),
            }
        };
        let output = stream::iter(vec![Ok(Bytes::from(data))]);
        if !follow {
            return Ok(output.boxed());
        }

        let running = Arc::clone(&self.running);
        let id = id.to_string();
        let until_exit = stream::once(async move {
            while is_running(&running, &id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .filter_map(|()| async { None::<Result<Bytes>> });
        Ok(output.chain(until_exit).boxed())
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        self.record("create_volume")?;
        self.book.lock().unwrap().volumes.push((
            name.to_string(),
            driver.to_string(),
            options.clone(),
        ));
        Ok(())
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        self.record("has_image")?;
        Ok(self.book.lock().unwrap().images.contains(image))
    }

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()> {
        self.record("pull")?;
        self.book
            .lock()
            .unwrap()
            .images
            .insert(format!("{repository}:{tag}"));
        Ok(())
    }

    async fn reconnect(&self) {
        self.book.lock().unwrap().calls.push("reconnect".to_string());
    }
}

/// Standard input end that records bytes and counts shutdowns.
struct FakeSocket {
    data: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl AsyncWrite for FakeSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Fake Command Runner
// =============================================================================

type Effect = Box<dyn Fn(&FakeRunner) + Send + Sync>;

struct Rule {
    prefix: String,
    output: CommandOutput,
    remaining: Option<usize>,
    effect: Option<Effect>,
}

/// Scripted [`CommandRunner`].
///
/// Rules match on a prefix of `"program arg1 arg2 ..."`; the most recently
/// added live rule wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(
        &self,
        prefix: &str,
        output: CommandOutput,
        remaining: Option<usize>,
        effect: Option<Effect>,
    ) {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            output,
            remaining,
            effect,
        });
    }

    /// Commands starting with `prefix` succeed and print `stdout`.
    pub fn on(&self, prefix: &str, stdout: &str) {
        self.push(prefix, ok(stdout), None, None);
    }

    /// Commands starting with `prefix` exit 1 with `stderr`.
    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.push(prefix, failed(stderr), None, None);
    }

    /// Like [`FakeRunner::fail`] for the next `times` matches only.
    pub fn fail_times(&self, prefix: &str, times: usize, stderr: &str) {
        self.push(prefix, failed(stderr), Some(times), None);
    }

    /// Commands starting with `prefix` succeed and then run `effect`.
    pub fn on_then(
        &self,
        prefix: &str,
        stdout: &str,
        effect: impl Fn(&FakeRunner) + Send + Sync + 'static,
    ) {
        self.push(prefix, ok(stdout), None, Some(Box::new(effect)));
    }

    /// Every command line run so far.
    pub fn invocations(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Number of command lines starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[String], _limit: Duration) -> Result<CommandOutput> {
        let line = if args.is_empty() {
            program.to_string()
        } else {
            format!("{program} {}", args.join(" "))
        };
        self.log.lock().unwrap().push(line.clone());

        let (output, effect_index) = {
            let mut rules = self.rules.lock().unwrap();
            let hit = rules
                .iter_mut()
                .enumerate()
                .rev()
                .find(|(_, rule)| rule.remaining != Some(0) && line.starts_with(&rule.prefix));
            match hit {
                Some((index, rule)) => {
                    if let Some(remaining) = rule.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    (rule.output.clone(), rule.effect.is_some().then_some(index))
                }
                None => (ok(""), None),
            }
        };

        if let Some(index) = effect_index {
            // Effects add rules; run them with the lock released.
            let effect = self.rules.lock().unwrap()[index].effect.take();
            if let Some(effect) = effect {
                effect(self);
                self.rules.lock().unwrap()[index].effect = Some(effect);
            }
        }
        Ok(output)
    }
}

// =============================================================================
// Scripted docker-machine VM
// =============================================================================

pub const VM: &str = "taskbox";

/// Scripts a healthy VirtualBox docker-machine VM named [`VM`] with
/// 1 CPU and 1024 MiB. `start` and `stop` flip the reported status.
pub fn scripted_machine(running: bool) -> Arc<FakeRunner> {
    let runner = FakeRunner::new();
    runner.on("docker-machine ls -q", VM);
    runner.on("docker-machine inspect", "virtualbox");
    runner.on(
        "docker-machine status",
        if running { "Running" } else { "Stopped" },
    );
    runner.on(
        "docker-machine env",
        "export DOCKER_TLS_VERIFY=\"1\"\nexport DOCKER_HOST=\"tcp://192.168.99.100:2376\"\nexport DOCKER_CERT_PATH=\"/certs\"",
    );
    runner.on("docker-machine ip", "192.168.99.100");
    runner.on_then("docker-machine stop", "", |r| {
        r.on("docker-machine status", "Stopped");
    });
    runner.on_then("docker-machine start", "", |r| {
        r.on("docker-machine status", "Running");
    });
    runner.on("VBoxManage showvminfo", "name=\"taskbox\"\ncpus=1\nmemory=1024\n");
    runner
}

//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::connection::{ConnectionDescriptor, ConnectionResolver, ResolutionError};
use crate::target::Target;
use crate::transport::{CommandOutput, CommandRunner, RunnerFuture, TransportError};

/// Scripted behaviour for one host.
#[derive(Clone, Debug, Default)]
struct Script {
    output: CommandOutput,
    delay: Duration,
    spawn_error: bool,
    panics: bool,
}

impl Script {
    fn success() -> Self {
        Self {
            output: CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            },
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct RunnerState {
    default: Script,
    scripts: HashMap<String, Script>,
    invocations: Vec<CommandInvocation>,
    in_flight: usize,
    peak: usize,
}

impl Default for RunnerState {
    fn default() -> Self {
        Self {
            default: Script::success(),
            scripts: HashMap::new(),
            invocations: Vec::new(),
            in_flight: 0,
            peak: 0,
        }
    }
}

/// Command runner returning scripted outputs keyed by remote host.
///
/// The host is taken from the first `user@host` argument, so the same script
/// applies to `ssh` and `scp` invocations. Hosts without a script succeed
/// with empty output. Clones share state, so a test can keep a handle while
/// the transport owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<StdMutex<RunnerState>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Host extracted from the arguments, if any.
    pub host: Option<String>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a runner where every host succeeds with empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StdMutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, host: &str, edit: impl FnOnce(&mut Script)) {
        let mut state = self.lock();
        let fallback = state.default.clone();
        edit(state.scripts.entry(host.to_owned()).or_insert(fallback));
    }

    /// Scripts the output returned for `host`.
    pub fn respond(
        &self,
        host: &str,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        let output = CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
        self.update(host, |script| script.output = output);
    }

    /// Scripts a successful exit with the given stdout for `host`.
    pub fn respond_ok(&self, host: &str, stdout: impl Into<String>) {
        self.respond(host, Some(0), stdout, "");
    }

    /// Delays every invocation against `host` by `delay`.
    pub fn delay(&self, host: &str, delay: Duration) {
        self.update(host, |script| script.delay = delay);
    }

    /// Makes invocations against `host` fail to spawn.
    pub fn fail_spawn(&self, host: &str) {
        self.update(host, |script| script.spawn_error = true);
    }

    /// Makes invocations against `host` panic, taking down the calling task.
    pub fn panic_on(&self, host: &str) {
        self.update(host, |script| script.panics = true);
    }

    /// Sets the output returned for hosts without their own script, and for
    /// invocations that name no host at all.
    pub fn set_default_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.lock().default.output = CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
    }

    /// Delays every invocation against hosts without their own script.
    pub fn default_delay(&self, delay: Duration) {
        self.lock().default.delay = delay;
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Returns the hosts contacted, in invocation order.
    #[must_use]
    pub fn hosts_contacted(&self) -> Vec<String> {
        self.lock()
            .invocations
            .iter()
            .filter_map(|invocation| invocation.host.clone())
            .collect()
    }

    /// Returns the highest number of invocations observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.lock().peak
    }
}

/// Decrements the in-flight counter even when the run future is dropped.
struct InFlight<'a> {
    runner: &'a ScriptedRunner,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.runner.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        Box::pin(async move {
            let host = host_from_args(args);
            let script = {
                let mut state = self.lock();
                state.invocations.push(CommandInvocation {
                    program: program.to_owned(),
                    args: args.to_vec(),
                    host: host.clone(),
                });
                state.in_flight += 1;
                state.peak = state.peak.max(state.in_flight);
                host.as_ref()
                    .and_then(|name| state.scripts.get(name))
                    .unwrap_or(&state.default)
                    .clone()
            };
            let _in_flight = InFlight { runner: self };

            if !script.delay.is_zero() {
                tokio::time::sleep(script.delay).await;
            }
            assert!(!script.panics, "scripted panic for {host:?}");
            if script.spawn_error {
                return Err(TransportError::Spawn {
                    program: program.to_owned(),
                    message: String::from("scripted spawn failure"),
                });
            }
            Ok(script.output)
        })
    }
}

fn host_from_args(args: &[OsString]) -> Option<String> {
    args.iter()
        .filter_map(|arg| arg.to_str())
        .find_map(|arg| arg.split_once('@'))
        .map(|(_, rest)| {
            rest.split_once(':')
                .map_or(rest, |(host, _)| host)
                .to_owned()
        })
}

/// Resolver decorator tracking how many resolutions run concurrently.
///
/// Each call holds for `hold` so overlapping calls on a multi-threaded
/// runtime are observable.
pub struct CountingResolver {
    inner: Arc<dyn ConnectionResolver>,
    hold: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingResolver {
    /// Wraps `inner`, holding each call for `hold`.
    #[must_use]
    pub fn new(inner: Arc<dyn ConnectionResolver>, hold: Duration) -> Self {
        Self {
            inner,
            hold,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Returns the total number of calls made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConnectionResolver for CountingResolver {
    fn resolve(&self, target_id: &str) -> Result<ConnectionDescriptor, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        if !self.hold.is_zero() {
            std::thread::sleep(self.hold);
        }
        let resolved = self.inner.resolve(target_id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        resolved
    }
}

/// Builds a target reachable at `address` tagged `env=<env>`.
#[must_use]
pub fn fleet_target(id: &str, name: &str, env: &str, address: &str) -> Target {
    Target::new(id, name)
        .with_tag("env", env)
        .with_connection(address)
}

/// Builds `count` targets named `host-1..=host-count`, each reachable at
/// `10.0.0.<n>`.
#[must_use]
pub fn numbered_targets(count: usize) -> Vec<Target> {
    (1..=count)
        .map(|n| {
            fleet_target(
                &format!("srv-{n}"),
                &format!("host-{n}"),
                "dev",
                &format!("10.0.0.{n}"),
            )
        })
        .collect()
}

/// Produces an inventory file body from `(id, name, tags, address)` records.
#[must_use]
pub fn json_inventory(records: &[(&str, &str, &[(&str, &str)], &str)]) -> String {
    let items = records
        .iter()
        .map(|(id, name, tags, address)| {
            let tags_json = tags
                .iter()
                .map(|(key, value)| format!("\"{key}\":\"{value}\""))
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{{\"id\":\"{id}\",\"name\":\"{name}\",\"tags\":{{{tags_json}}},\"address\":\"{address}\"}}"
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("[{items}]")
}

/// Produces a minimal JSON payload matching `scw instance server list -o json`
/// from `(id, name, tags, public_ip)` records.
#[must_use]
pub fn json_servers(servers: &[(&str, &str, &[&str], Option<&str>)]) -> String {
    let items = servers
        .iter()
        .map(|(id, name, tags, public_ip)| {
            let tags_json = tags
                .iter()
                .map(|tag| format!("\"{tag}\""))
                .collect::<Vec<_>>()
                .join(",");
            let ip_json = public_ip.map_or_else(
                || String::from("null"),
                |address| format!("{{\"address\":\"{address}\"}}"),
            );
            format!(
                "{{\"id\":\"{id}\",\"name\":\"{name}\",\"tags\":[{tags_json}],\"public_ip\":{ip_json}}}"
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("[{items}]")
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

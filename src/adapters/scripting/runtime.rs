//! A single scripting runtime.
//!
//! Each runtime owns a dedicated OS thread holding a `boa_engine` [`Context`], which is not
//! `Send`. Invocations are queued over a channel and answered through oneshot replies, so the
//! async proxy never blocks on script execution. Promise jobs and `sleep` timers are driven on
//! the runtime thread until the entry point settles or the deadline passes. Synchronous code
//! is bounded by the context's loop iteration and recursion limits instead.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use boa_engine::{Context, JsError, JsNativeErrorKind, JsResult, JsValue, Source};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::context::{Invocation, Outcome, ScriptState};
use crate::ports::scripting::{EntryPoint, ScriptError, ScriptResult};

/// Deadline for an entry point's returned promise to settle.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

const PRELUDE: &str = include_str!("prelude.js");
const STACK_SIZE: usize = 8 * 1024 * 1024;

/// A transpiled module ready to be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    pub name: String,
    pub namespace: String,
    /// SHA-1 of the module type and payload
    pub digest: String,
    pub code: Arc<str>,
}

/// Entry points a runtime provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntrySet(u8);

impl EntrySet {
    fn bit(entry: EntryPoint) -> u8 {
        match entry {
            EntryPoint::FetchUpstream => 1,
            EntryPoint::RequestModifier => 1 << 1,
            EntryPoint::ResponseModifier => 1 << 2,
            EntryPoint::RequestHandler => 1 << 3,
            EntryPoint::ErrorHandler => 1 << 4,
        }
    }

    pub fn insert(&mut self, entry: EntryPoint) {
        self.0 |= Self::bit(entry);
    }

    pub fn contains(self, entry: EntryPoint) -> bool {
        self.0 & Self::bit(entry) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn from_names(names: &[String]) -> Self {
        let mut set = Self::default();
        for entry in EntryPoint::ALL {
            if names.iter().any(|n| n == entry.as_str()) {
                set.insert(entry);
            }
        }
        set
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Used in logs, usually `"{route}/{namespace}"`
    pub label: String,
    /// Forward `console.*` output to tracing
    pub console: bool,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
}

struct Job {
    entry: EntryPoint,
    input: String,
    reply: oneshot::Sender<ScriptResult<Invocation>>,
}

pub struct ScriptRuntime {
    jobs: mpsc::Sender<Job>,
    entries: EntrySet,
    busy: AtomicBool,
    tainted: AtomicBool,
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("entries", &self.entries)
            .field("tainted", &self.is_tainted())
            .finish()
    }
}

impl ScriptRuntime {
    /// Start a runtime thread and evaluate `modules` in order.
    pub async fn spawn(
        modules: Arc<[CompiledModule]>,
        options: RuntimeOptions,
    ) -> ScriptResult<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        thread::Builder::new()
            .name("dgate-script".into())
            .stack_size(STACK_SIZE)
            .spawn(move || run(&modules, &options, ready_tx, jobs_rx))
            .map_err(|e| ScriptError::Compile(format!("failed to start runtime thread: {e}")))?;
        let entries = ready_rx.await.map_err(|_| ScriptError::Stopped)??;
        Ok(Self {
            jobs: jobs_tx,
            entries,
            busy: AtomicBool::new(false),
            tainted: AtomicBool::new(false),
        })
    }

    pub fn entries(&self) -> EntrySet {
        self.entries
    }

    pub fn has(&self, entry: EntryPoint) -> bool {
        self.entries.contains(entry)
    }

    /// A runtime that timed out or was abandoned mid-invocation must not be reused.
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Acquire) || self.busy.load(Ordering::Acquire)
    }

    /// Run `entry` against `state`, waiting for any returned promise to settle.
    pub async fn invoke(&self, entry: EntryPoint, state: &ScriptState) -> ScriptResult<Invocation> {
        let input = serde_json::to_string(state).map_err(|e| ScriptError::Runtime {
            entry,
            message: format!("failed to encode script state: {e}"),
        })?;
        let (reply, rx) = oneshot::channel();
        self.busy.store(true, Ordering::Release);
        self.jobs
            .send(Job {
                entry,
                input,
                reply,
            })
            .map_err(|_| ScriptError::Stopped)?;

        // the runtime thread enforces the deadline; this only guards against a wedged thread
        let result = match tokio::time::timeout(SCRIPT_TIMEOUT + Duration::from_secs(1), rx).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScriptError::Stopped),
            Err(_) => {
                warn!(%entry, "Script runtime did not answer before the deadline");
                Err(ScriptError::Timeout {
                    entry,
                    secs: SCRIPT_TIMEOUT.as_secs(),
                })
            }
        };
        if matches!(
            result,
            Err(ScriptError::Timeout { .. }
                | ScriptError::LimitExceeded { .. }
                | ScriptError::Stopped)
        ) {
            self.tainted.store(true, Ordering::Release);
        }
        self.busy.store(false, Ordering::Release);
        result
    }

    /// Stop the runtime thread once its current job, if any, completes.
    pub fn stop(self) {
        drop(self.jobs);
    }
}

fn quote(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

fn eval(context: &mut Context, code: &str) -> JsResult<JsValue> {
    context.eval(Source::from_bytes(code))
}

fn is_limit(err: &JsError) -> bool {
    err.as_native()
        .is_some_and(|native| matches!(native.kind, JsNativeErrorKind::RuntimeLimit))
}

fn entry_failure(entry: EntryPoint, err: JsError) -> ScriptError {
    if is_limit(&err) {
        ScriptError::LimitExceeded {
            entry,
            message: err.to_string(),
        }
    } else {
        ScriptError::Runtime {
            entry,
            message: err.to_string(),
        }
    }
}

fn eval_string(context: &mut Context, code: &str) -> Option<String> {
    eval(context, code)
        .ok()
        .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()))
}

fn run(
    modules: &[CompiledModule],
    options: &RuntimeOptions,
    ready: oneshot::Sender<ScriptResult<EntrySet>>,
    jobs: mpsc::Receiver<Job>,
) {
    let mut context = Context::default();
    let limits = context.runtime_limits_mut();
    limits.set_loop_iteration_limit(options.loop_iteration_limit);
    limits.set_recursion_limit(options.recursion_limit);
    let loaded = load(&mut context, modules);
    drain_logs(&mut context, options);
    let ok = loaded.is_ok();
    if ready.send(loaded).is_err() || !ok {
        return;
    }
    debug!(runtime = %options.label, "Script runtime started");

    while let Ok(Job {
        entry,
        input,
        reply,
    }) = jobs.recv()
    {
        let result = invoke(&mut context, entry, &input);
        drain_logs(&mut context, options);
        let exhausted = matches!(result, Err(ScriptError::LimitExceeded { .. }));
        if exhausted {
            warn!(runtime = %options.label, %entry, "Script hit a runtime limit, retiring runtime");
        }
        let _ = reply.send(result);
        if exhausted {
            break;
        }
    }
    debug!(runtime = %options.label, "Script runtime stopped");
}

fn load(context: &mut Context, modules: &[CompiledModule]) -> ScriptResult<EntrySet> {
    eval(context, PRELUDE).map_err(|e| ScriptError::Compile(format!("prelude: {e}")))?;
    for module in modules {
        eval(context, &format!("__dgate_begin_module({})", quote(&module.name)))
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        eval(context, &module.code)
            .map_err(|e| ScriptError::Compile(format!("{}: {e}", module.name)))?;
        let _ = context.run_jobs();
    }
    let names = eval_string(context, "__dgate_entries()")
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .unwrap_or_default();
    Ok(EntrySet::from_names(&names))
}

fn invoke(context: &mut Context, entry: EntryPoint, input: &str) -> ScriptResult<Invocation> {
    let deadline = Instant::now() + SCRIPT_TIMEOUT;
    let call = format!(
        "__dgate_invoke({}, {})",
        quote(entry.as_str()),
        quote(input)
    );
    eval(context, &call).map_err(|e| entry_failure(entry, e))?;

    loop {
        let _ = context.run_jobs();
        if let Some(raw) = eval_string(context, "globalThis.__dgate_result") {
            return settle(entry, &raw);
        }
        let next = eval(context, "__dgate_tick()")
            .ok()
            .and_then(|v| v.as_number())
            .unwrap_or(-1.0);
        if next < 0.0 {
            let _ = context.run_jobs();
            return match eval_string(context, "globalThis.__dgate_result") {
                Some(raw) => settle(entry, &raw),
                None => Err(ScriptError::Runtime {
                    entry,
                    message: "returned promise never settled".into(),
                }),
            };
        }
        if next < 1.0 {
            continue;
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ScriptError::Timeout {
                entry,
                secs: SCRIPT_TIMEOUT.as_secs(),
            });
        }
        thread::sleep(Duration::from_millis(next as u64).min(deadline - now));
    }
}

fn settle(entry: EntryPoint, raw: &str) -> ScriptResult<Invocation> {
    let outcome: Outcome = serde_json::from_str(raw).map_err(|e| ScriptError::InvalidReturn {
        entry,
        message: e.to_string(),
    })?;
    if !outcome.ok {
        return Err(ScriptError::Runtime {
            entry,
            message: outcome.error.unwrap_or_else(|| "unknown error".into()),
        });
    }
    let state = outcome.state.ok_or_else(|| ScriptError::InvalidReturn {
        entry,
        message: "missing script state".into(),
    })?;
    Ok(Invocation {
        value: outcome.value,
        state,
    })
}

fn drain_logs(context: &mut Context, options: &RuntimeOptions) {
    let Some(raw) = eval_string(context, "__dgate_drain_logs()") else {
        return;
    };
    if !options.console {
        return;
    }
    let Ok(lines) = serde_json::from_str::<Vec<(String, String)>>(&raw) else {
        return;
    };
    for (level, message) in lines {
        let runtime = options.label.as_str();
        match level.as_str() {
            "error" => error!(target: "dgate::script", runtime, "{message}"),
            "warn" => warn!(target: "dgate::script", runtime, "{message}"),
            "debug" => debug!(target: "dgate::script", runtime, "{message}"),
            _ => info!(target: "dgate::script", runtime, "{message}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{adapters::scripting::transpile::transpile, core::resources::ModuleType};

    pub(crate) fn compiled(name: &str, source: &str) -> CompiledModule {
        CompiledModule {
            name: name.into(),
            namespace: "test".into(),
            digest: String::new(),
            code: transpile(source, ModuleType::Javascript).unwrap().into(),
        }
    }

    pub(crate) fn options() -> RuntimeOptions {
        RuntimeOptions {
            label: "test".into(),
            console: false,
            loop_iteration_limit: 100_000,
            recursion_limit: 256,
        }
    }

    async fn runtime(sources: &[(&str, &str)]) -> ScriptResult<ScriptRuntime> {
        let modules: Vec<_> = sources.iter().map(|(n, s)| compiled(n, s)).collect();
        ScriptRuntime::spawn(modules.into(), options()).await
    }

    fn state() -> ScriptState {
        ScriptState {
            request: crate::adapters::scripting::context::RequestState {
                method: "GET".into(),
                url: "http://localhost/a".into(),
                path: "/a".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_modifier_mutates_headers() {
        let rt = runtime(&[(
            "m1",
            "export function requestModifier(ctx) { ctx.request().headers.set('X-Test', '1'); }",
        )])
        .await
        .unwrap();
        assert!(rt.has(EntryPoint::RequestModifier));
        assert!(!rt.has(EntryPoint::FetchUpstream));

        let out = rt
            .invoke(EntryPoint::RequestModifier, &state())
            .await
            .unwrap();
        assert_eq!(out.state.request.headers["x-test"], vec!["1"]);
        assert!(!rt.is_tainted());
    }

    #[tokio::test]
    async fn test_async_entry_with_sleep() {
        let rt = runtime(&[(
            "m1",
            "import { sleep } from 'dgate';\nexport async function fetchUpstream(ctx) { await sleep(10); return 'http://example.com/'; }",
        )])
        .await
        .unwrap();
        let out = rt.invoke(EntryPoint::FetchUpstream, &state()).await.unwrap();
        assert_eq!(out.value, Value::String("http://example.com/".into()));
    }

    #[tokio::test]
    async fn test_global_handler_and_errors() {
        let rt = runtime(&[(
            "m1",
            "function requestHandler(ctx) { ctx.response().status(201).send('hi'); }\nfunction errorHandler(ctx, err) { throw new Error('boom'); }",
        )])
        .await
        .unwrap();
        let out = rt.invoke(EntryPoint::RequestHandler, &state()).await.unwrap();
        assert_eq!(out.state.response.status, Some(201));
        assert_eq!(out.state.response.body.as_deref(), Some("hi"));

        let err = rt
            .invoke(EntryPoint::ErrorHandler, &state())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ScriptError::Runtime {
                entry: EntryPoint::ErrorHandler,
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn test_exports_shadow_globals_across_modules() {
        let rt = runtime(&[
            ("a", "export function fetchUpstream() { return 'http://a/'; }"),
            ("b", "function fetchUpstream() { return 'http://b/'; }"),
        ])
        .await
        .unwrap();
        let out = rt.invoke(EntryPoint::FetchUpstream, &state()).await.unwrap();
        assert_eq!(out.value, Value::String("http://a/".into()));
    }

    #[tokio::test]
    async fn test_evaluation_error_is_compile_error() {
        let err = runtime(&[("broken", "throw new Error('nope');")])
            .await
            .unwrap_err();
        match err {
            ScriptError::Compile(message) => assert!(message.starts_with("broken:")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_busy_loop_hits_iteration_limit() {
        let rt = runtime(&[(
            "spin",
            "export function requestHandler(ctx) { while (true) {} }\nexport function fetchUpstream() { let n = 0; for (let i = 0; i < 1000; i++) { n += i; } return 'http://u/' + n; }",
        )])
        .await
        .unwrap();
        let out = rt.invoke(EntryPoint::FetchUpstream, &state()).await.unwrap();
        assert_eq!(out.value, Value::String("http://u/499500".into()));

        let err = rt
            .invoke(EntryPoint::RequestHandler, &state())
            .await
            .unwrap_err();
        assert!(
            matches!(err, ScriptError::LimitExceeded { entry: EntryPoint::RequestHandler, .. }),
            "{err:?}"
        );
        assert!(rt.is_tainted());
        assert_eq!(
            rt.invoke(EntryPoint::FetchUpstream, &state()).await.unwrap_err(),
            ScriptError::Stopped
        );
    }

    #[tokio::test]
    async fn test_unbounded_recursion_hits_limit() {
        let rt = runtime(&[(
            "deep",
            "function down(n) { return down(n + 1) + 1; }\nexport function requestModifier() { down(0); }",
        )])
        .await
        .unwrap();
        let err = rt
            .invoke(EntryPoint::RequestModifier, &state())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::LimitExceeded { .. }), "{err:?}");
        assert!(rt.is_tainted());
    }
}

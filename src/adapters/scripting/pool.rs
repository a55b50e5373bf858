//! Per-route pool of warm script runtimes.
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    context::{Invocation, ScriptState},
    runtime::{CompiledModule, EntrySet, RuntimeOptions, ScriptRuntime},
};
use crate::{
    config::ModulePoolConfig,
    ports::scripting::{EntryPoint, ScriptError, ScriptResult},
};

pub struct RuntimePool {
    modules: Arc<[CompiledModule]>,
    options: RuntimeOptions,
    min: usize,
    max: usize,
    idle: Mutex<VecDeque<ScriptRuntime>>,
    live: AtomicUsize,
    entries: EntrySet,
    token: CancellationToken,
}

impl std::fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePool")
            .field("label", &self.options.label)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("live", &self.live())
            .finish()
    }
}

impl RuntimePool {
    /// Build a pool; fails when the first runtime cannot evaluate the modules.
    pub async fn new(
        modules: Arc<[CompiledModule]>,
        options: RuntimeOptions,
        size: ModulePoolConfig,
    ) -> ScriptResult<Arc<Self>> {
        let max = size.max.max(1);
        let min = size.min.clamp(1, max);
        let first = ScriptRuntime::spawn(modules.clone(), options.clone()).await?;
        let pool = Arc::new(Self {
            entries: first.entries(),
            modules,
            options,
            min,
            max,
            idle: Mutex::new(VecDeque::from([first])),
            live: AtomicUsize::new(1),
            token: CancellationToken::new(),
        });
        for _ in 1..min {
            match ScriptRuntime::spawn(pool.modules.clone(), pool.options.clone()).await {
                Ok(runtime) => {
                    pool.live.fetch_add(1, Ordering::AcqRel);
                    pool.idle.lock().push_back(runtime);
                }
                Err(e) => {
                    warn!(runtime = %pool.options.label, error = %e, "Failed to prewarm script runtime");
                    break;
                }
            }
        }
        debug!(runtime = %pool.options.label, min, max, "Runtime pool ready");
        Ok(pool)
    }

    pub fn entries(&self) -> EntrySet {
        self.entries
    }

    pub fn has(&self, entry: EntryPoint) -> bool {
        self.entries.contains(entry)
    }

    /// Runtimes currently alive, idle or borrowed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Take an idle runtime, or start a new one while below `max`.
    pub async fn borrow(self: &Arc<Self>) -> ScriptResult<PooledRuntime> {
        if self.is_closed() {
            return Err(ScriptError::Closed);
        }
        if let Some(runtime) = self.idle.lock().pop_front() {
            return Ok(PooledRuntime::new(self.clone(), runtime));
        }
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return Err(ScriptError::Exhausted);
        }
        match ScriptRuntime::spawn(self.modules.clone(), self.options.clone()).await {
            Ok(runtime) => Ok(PooledRuntime::new(self.clone(), runtime)),
            Err(e) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn give_back(&self, runtime: ScriptRuntime) {
        if self.is_closed() || runtime.is_tainted() {
            self.retire(runtime);
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max {
            idle.push_back(runtime);
        } else {
            drop(idle);
            self.retire(runtime);
        }
    }

    fn retire(&self, runtime: ScriptRuntime) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        runtime.stop();
    }

    /// Stop idle runtimes; borrowed ones stop when they come back.
    pub fn close(&self) {
        self.token.cancel();
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for runtime in drained {
            self.retire(runtime);
        }
    }
}

/// A borrowed runtime; returned to its pool on drop.
pub struct PooledRuntime {
    pool: Arc<RuntimePool>,
    runtime: Option<ScriptRuntime>,
}

impl std::fmt::Debug for PooledRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledRuntime").finish_non_exhaustive()
    }
}

impl PooledRuntime {
    fn new(pool: Arc<RuntimePool>, runtime: ScriptRuntime) -> Self {
        Self {
            pool,
            runtime: Some(runtime),
        }
    }

    pub fn has(&self, entry: EntryPoint) -> bool {
        self.runtime.as_ref().is_some_and(|r| r.has(entry))
    }

    pub async fn invoke(&self, entry: EntryPoint, state: &ScriptState) -> ScriptResult<Invocation> {
        match &self.runtime {
            Some(runtime) => runtime.invoke(entry, state).await,
            None => Err(ScriptError::Stopped),
        }
    }
}

impl Drop for PooledRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.pool.give_back(runtime);
        }
    }
}

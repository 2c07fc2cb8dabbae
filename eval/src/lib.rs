//! The zb evaluator: a sandboxed Lua interpreter that turns declarative
//! recipes into derivations and deposits them into a store.
//!
//! Worker states are configured from a shared zygote blueprint; modules
//! load in their own states behind promises; strings carry context tags
//! naming the store objects they reference; `derivation`, `toFile` and
//! `path` commit objects to the store through the [EvalStore]
//! collaborator.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mlua::{Lua, MultiValue};
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use zb_store::derivation::OutputRef;
use zb_store::store::StoreError;
use zb_store::{Directory, StorePath};

mod context;
mod derivation;
mod lazy;
mod module;
mod source;
mod stamp_cache;
mod value;
mod zygote;

pub use context::{ContextRegistry, ContextTag};
pub use value::EvalValue;

/// Result of asking the store to realize a derivation output.
#[derive(Clone, Debug)]
pub struct BuildResult {
    pub output: OutputRef,
    /// The realized store path; absent when the build failed.
    pub path: Option<StorePath>,
}

/// The store surface the evaluator drives.
#[async_trait]
pub trait EvalStore: Send + Sync {
    /// Consumes one complete export stream; repeated objects are
    /// no-ops.
    async fn store_import(&self, r: &mut (dyn Read + Send)) -> Result<(), StoreError>;

    async fn object_exists(&self, path: &StorePath) -> Result<bool, StoreError>;

    /// Turns derivation outputs into concrete store paths, building as
    /// needed.
    async fn realize(&self, outputs: &[OutputRef]) -> Result<Vec<BuildResult>, StoreError>;
}

#[async_trait]
impl EvalStore for zb_store::store::MemoryStore {
    async fn store_import(&self, r: &mut (dyn Read + Send)) -> Result<(), StoreError> {
        zb_store::store::Importer::store_import(self, r).await
    }

    async fn object_exists(&self, path: &StorePath) -> Result<bool, StoreError> {
        Ok(self.contains(path))
    }

    async fn realize(&self, _outputs: &[OutputRef]) -> Result<Vec<BuildResult>, StoreError> {
        Err(StoreError::Other(
            "memory store cannot build derivations".to_string(),
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Lua(#[from] mlua::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("stamp cache: {0}")]
    StampCache(#[from] rusqlite::Error),
    #[error("evaluation canceled")]
    Canceled,
    #[error("evaluator already closed")]
    AlreadyClosed,
}

/// Options for [Evaluator::new].
pub struct Options {
    pub store_dir: Directory,
    pub store: Arc<dyn EvalStore>,
    /// Location of the stamp-cache database used by `path`; in-memory
    /// when absent.
    pub cache_db: Option<PathBuf>,
}

pub(crate) struct EvalInner {
    pub dir: Directory,
    pub store: Arc<dyn EvalStore>,
    /// Zygote blueprint; its lock is held only while configuring a new
    /// state.
    pub zygote: Mutex<zygote::Zygote>,
    /// The import registry: resolved filename to module promise.
    pub modules: Mutex<HashMap<PathBuf, Arc<module::Module>>>,
    /// Keeps lazy tables (and through them their owner states) alive
    /// until close.
    pub lazies: Mutex<Vec<Arc<lazy::LazyTable>>>,
    pub contexts: ContextRegistry,
    /// Connection pool of size one, used exclusively by `path`.
    pub stamps: Mutex<Option<stamp_cache::StampCache>>,
    /// Base context: canceling it aborts all pending work. Separate
    /// from any request context so pending imports survive a single
    /// request's cancellation.
    pub cancel: CancellationToken,
    /// Owned runtime backing `handle` when no ambient one exists.
    #[allow(dead_code)]
    runtime: Option<tokio::runtime::Runtime>,
    pub handle: tokio::runtime::Handle,
    pub tasks: Mutex<Vec<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EvalInner {
    /// Runs a store future to completion from sync code.
    /// Must not be called from inside an async execution context.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

/// Context attached to each worker state.
pub(crate) struct StateCtx {
    pub eval: Weak<EvalInner>,
    /// Import chain that led to this state, used for cycle detection.
    /// Cleared once the module finishes loading.
    pub chain: Vec<PathBuf>,
    /// Source file of the code this state runs, if any.
    pub source: Option<PathBuf>,
    /// Request context; checked alongside the base context at
    /// suspension points.
    pub request: CancellationToken,
}

impl StateCtx {
    pub fn eval(&self) -> mlua::Result<Arc<EvalInner>> {
        self.eval
            .upgrade()
            .ok_or_else(|| mlua::Error::RuntimeError("evaluator is closed".to_string()))
    }
}

/// Fetches the evaluator behind a Lua state.
pub(crate) fn state_eval(lua: &Lua) -> mlua::Result<Arc<EvalInner>> {
    let ctx = lua
        .app_data_ref::<StateCtx>()
        .ok_or_else(|| mlua::Error::RuntimeError("state has no evaluator".to_string()))?;
    ctx.eval()
}

/// Waits on a condition guarded by `mutex` until `done` returns true,
/// aborting with [mlua::Error] when either context is canceled.
pub(crate) fn wait_latch<T>(
    mutex: &Mutex<T>,
    cond: &Condvar,
    base: &CancellationToken,
    request: &CancellationToken,
    mut done: impl FnMut(&mut T) -> bool,
) -> mlua::Result<()> {
    let mut guard = mutex.lock();
    loop {
        if done(&mut guard) {
            return Ok(());
        }
        if base.is_cancelled() || request.is_cancelled() {
            return Err(mlua::Error::RuntimeError("evaluation canceled".to_string()));
        }
        cond.wait_for(&mut guard, Duration::from_millis(20));
    }
}

pub struct Evaluator {
    inner: Arc<EvalInner>,
}

impl Evaluator {
    pub fn new(opts: Options) -> Result<Evaluator, Error> {
        let (runtime, handle) = match tokio::runtime::Handle::try_current() {
            Ok(h) => (None, h),
            Err(_) => {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()?;
                let h = rt.handle().clone();
                (Some(rt), h)
            }
        };

        let stamps = match &opts.cache_db {
            Some(path) => stamp_cache::StampCache::open(path)?,
            None => stamp_cache::StampCache::open_in_memory()?,
        };

        Ok(Evaluator {
            inner: Arc::new(EvalInner {
                dir: opts.store_dir,
                store: opts.store,
                zygote: Mutex::new(zygote::Zygote::new()),
                modules: Mutex::new(HashMap::new()),
                lazies: Mutex::new(Vec::new()),
                contexts: ContextRegistry::default(),
                stamps: Mutex::new(Some(stamps)),
                cancel: CancellationToken::new(),
                runtime,
                handle,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The evaluator's store directory.
    pub fn store_dir(&self) -> &Directory {
        &self.inner.dir
    }

    /// Evaluates a chunk of code in a fresh worker state and returns
    /// snapshots of its results.
    ///
    /// This is a blocking call; do not invoke it from inside an async
    /// execution context.
    #[instrument(skip_all, fields(chunk = name))]
    pub fn do_string(&self, code: &str, name: &str) -> Result<Vec<EvalValue>, Error> {
        self.do_string_with(self.inner.cancel.child_token(), code, name)
    }

    /// Like [Evaluator::do_string], canceled early when `request` is.
    pub fn do_string_with(
        &self,
        request: CancellationToken,
        code: &str,
        name: &str,
    ) -> Result<Vec<EvalValue>, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }

        let ctx = StateCtx {
            eval: Arc::downgrade(&self.inner),
            chain: Vec::new(),
            source: None,
            request,
        };
        let lua = self.inner.zygote.lock().spawn_state(ctx)?;

        let env = zygote::module_env(&lua)?;
        let results: MultiValue = lua
            .load(code)
            .set_name(name)
            .set_mode(mlua::ChunkMode::Text)
            .set_environment(env)
            .call(())?;

        let values: Vec<mlua::Value> = results.into_iter().collect();
        let mut out = Vec::with_capacity(values.len());
        for v in &values {
            out.push(value::snapshot(&self.inner, &lua, v)?);
        }
        Ok(out)
    }

    /// Imports `path` as a module, forces it, and returns a snapshot of
    /// its value.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn eval_file(&self, path: &Path) -> Result<EvalValue, Error> {
        let code = format!("return await(import({:?}))", path.to_string_lossy());
        let mut values = self.do_string(&code, "=(eval_file)")?;
        let value = values.drain(..).next().unwrap_or(EvalValue::Nil);
        Ok(value)
    }

    /// Cancels the base context, awaits all spawned import tasks, and
    /// closes the stamp-cache pool.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed_swap() {
            return Err(Error::AlreadyClosed);
        }

        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        debug!(count = tasks.len(), "joining import tasks");
        for task in tasks {
            let _ = task.join();
        }
        self.inner.modules.lock().clear();
        self.inner.lazies.lock().clear();
        *self.inner.stamps.lock() = None;
        Ok(())
    }

    fn closed_swap(&self) -> bool {
        self.inner.closed.swap(true, Ordering::AcqRel)
    }
}

impl Drop for Evaluator {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

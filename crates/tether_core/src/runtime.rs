//! Runtime
//!
//! A [`Runtime`] owns one JS execution context together with the registries
//! bound to it. The context lives on a dedicated JS thread fed by a FIFO job
//! queue; every interaction with the engine is a job on that queue.
//!
//! State machine: `Uninstalled -> Installed -> Deallocated`, each transition
//! at most once.

use crate::app::AppContext;
use crate::class::ClassRegistry;
use crate::context::ModuleContext;
use crate::dealloc::Deallocator;
use crate::engine::{CallId, EngineBindings, JsCallOutcome, JsEngine};
use crate::error::{panic_message, BridgeError, Result};
use crate::executor::BackgroundExecutor;
use crate::function::FunctionDescriptor;
use crate::promise::Promise;
use crate::settings::BridgeSettings;
use crate::shared::{ObjectId, SharedObjectRegistry};
use crate::value::JsValue;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Primary,
    /// Isolated context that may run concurrently with the primary one.
    Worklet,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Primary => "primary",
            RuntimeKind::Worklet => "worklet",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Uninstalled,
    Installed,
    Deallocated,
}

/// Script-visible member of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Function(String),
    Constructor { class: String },
    Method { class: String, name: String },
    Getter { class: String, name: String },
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Function(name) => f.write_str(name),
            Member::Constructor { class } => write!(f, "{class}.constructor"),
            Member::Method { class, name } => write!(f, "{class}.{name}"),
            Member::Getter { class, name } => write!(f, "{class}.{name} (getter)"),
        }
    }
}

/// Where a call is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub module: String,
    pub member: Member,
}

impl CallTarget {
    pub fn function(module: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            member: Member::Function(name.to_string()),
        }
    }

    pub fn constructor(module: &str, class: &str) -> Self {
        Self {
            module: module.to_string(),
            member: Member::Constructor {
                class: class.to_string(),
            },
        }
    }

    pub fn method(module: &str, class: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            member: Member::Method {
                class: class.to_string(),
                name: name.to_string(),
            },
        }
    }

    pub fn getter(module: &str, class: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            member: Member::Getter {
                class: class.to_string(),
                name: name.to_string(),
            },
        }
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.member)
    }
}

type Work = Box<dyn FnOnce(&mut dyn JsEngine) + Send>;

enum Job {
    Run(Work),
    Shutdown,
}

struct JsThread {
    sender: mpsc::UnboundedSender<Job>,
    thread: ThreadId,
}

enum State {
    Uninstalled,
    Installed(JsThread),
    Deallocated,
}

struct RuntimeInner {
    id: u64,
    kind: RuntimeKind,
    app: Weak<AppContext>,
    executor: BackgroundExecutor,
    thread_name: String,
    namespace: String,
    state: Mutex<State>,
    objects: Arc<SharedObjectRegistry>,
    classes: Arc<ClassRegistry>,
    deallocator: Deallocator,
    next_call: AtomicU64,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if !matches!(state, State::Deallocated) {
            *state = State::Deallocated;
            let ran = self.deallocator.deallocate();
            tracing::debug!(runtime = self.id, ran, "runtime dropped without deallocate");
        }
    }
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Non-owning handle to a [`Runtime`], held by engines and completions.
#[derive(Clone)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl Runtime {
    pub(crate) fn new(
        kind: RuntimeKind,
        app: Weak<AppContext>,
        executor: BackgroundExecutor,
        settings: &BridgeSettings,
    ) -> Self {
        let objects = Arc::new(SharedObjectRegistry::new());
        let classes = Arc::new(ClassRegistry::new());
        let deallocator = Deallocator::new();
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);

        // Reverse order on teardown: objects go before the classes they use.
        let registry = classes.clone();
        deallocator.register("classes", move || registry.clear());
        let registry = objects.clone();
        deallocator.register("shared-objects", move || {
            let released = registry.release_all();
            tracing::debug!(runtime = id, released, "shared objects released");
        });

        tracing::debug!(runtime = id, %kind, "runtime created");
        Self {
            inner: Arc::new(RuntimeInner {
                id,
                kind,
                app,
                executor,
                thread_name: settings.js_thread_name.clone(),
                namespace: settings.namespace.clone(),
                state: Mutex::new(State::Uninstalled),
                objects,
                classes,
                deallocator,
                next_call: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> RuntimeKind {
        self.inner.kind
    }

    pub fn status(&self) -> RuntimeStatus {
        match &*self.lock_state() {
            State::Uninstalled => RuntimeStatus::Uninstalled,
            State::Installed(_) => RuntimeStatus::Installed,
            State::Deallocated => RuntimeStatus::Deallocated,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.status() == RuntimeStatus::Installed
    }

    pub fn objects(&self) -> &SharedObjectRegistry {
        &self.inner.objects
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.inner.classes
    }

    /// Teardown actions of this runtime; register extra cleanup here.
    pub fn deallocator(&self) -> &Deallocator {
        &self.inner.deallocator
    }

    pub fn executor(&self) -> &BackgroundExecutor {
        &self.inner.executor
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Owning application context, if it is still alive.
    pub fn app(&self) -> Result<Arc<AppContext>> {
        self.inner
            .app
            .upgrade()
            .ok_or_else(|| BridgeError::context_lost("application context has been destroyed"))
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("runtime", id = self.inner.id, kind = %self.inner.kind)
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the runtime to a JS context built by `factory` on a fresh JS
    /// thread.
    ///
    /// Installing an installed runtime is a logged no-op. Classes of every
    /// registered module are added to the class registry, which is sealed
    /// afterwards.
    pub fn install<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn JsEngine>> + Send + 'static,
    {
        let span = self.span();
        let _entered = span.enter();
        let mut state = self.lock_state();
        match &*state {
            State::Installed(_) => {
                tracing::warn!("runtime is already installed; ignoring install()");
                return Ok(());
            }
            State::Deallocated => {
                return Err(BridgeError::context_lost("runtime has been deallocated"))
            }
            State::Uninstalled => {}
        }

        let app = self.app()?;
        let holders = app.modules().holders();
        for holder in &holders {
            for class in holder.definition().classes() {
                if let Err(error) = self.inner.classes.register(class.clone()) {
                    self.inner.classes.clear();
                    return Err(error.into());
                }
            }
        }
        let bindings = EngineBindings {
            runtime: self.downgrade(),
            namespace: self.inner.namespace.clone(),
            modules: holders
                .iter()
                .map(|holder| holder.definition().export())
                .collect(),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let thread_span = span.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.inner.thread_name, self.inner.id))
            .spawn(move || {
                let _entered = thread_span.enter();
                let engine = factory().and_then(|mut engine| {
                    engine.bind(bindings)?;
                    Ok(engine)
                });
                match engine {
                    Ok(mut engine) => {
                        let _ = ready_tx.send(Ok(()));
                        run_jobs(engine.as_mut(), receiver);
                        tracing::debug!("JS thread stopped");
                    }
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                    }
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(error) => {
                self.inner.classes.clear();
                return Err(BridgeError::context_lost(format!(
                    "failed to spawn JS thread: {error}"
                )));
            }
        };

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(BridgeError::context_lost(
                "JS thread exited during installation",
            ))
        });
        if let Err(error) = ready {
            let _ = handle.join();
            self.inner.classes.clear();
            return Err(error);
        }

        self.inner.classes.seal();
        let thread = handle.thread().id();
        let shutdown = sender.clone();
        self.inner.deallocator.register("js-thread", move || {
            let _ = shutdown.send(Job::Shutdown);
            // The last job may be the one tearing the runtime down.
            if thread::current().id() != handle.thread().id() && handle.join().is_err() {
                tracing::error!("JS thread panicked during shutdown");
            }
        });
        *state = State::Installed(JsThread { sender, thread });
        tracing::info!(modules = holders.len(), "runtime installed");
        Ok(())
    }

    /// Queue `work` on the JS thread. Jobs run in submission order.
    pub fn schedule<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&mut dyn JsEngine) + Send + 'static,
    {
        match &*self.lock_state() {
            State::Installed(thread) => thread
                .sender
                .send(Job::Run(Box::new(work)))
                .map_err(|_| BridgeError::context_lost("JS thread has stopped")),
            State::Uninstalled => Err(BridgeError::NotInstalled),
            State::Deallocated => {
                tracing::warn!(runtime = self.inner.id, "schedule on a deallocated runtime");
                Err(BridgeError::context_lost("runtime has been deallocated"))
            }
        }
    }

    /// Evaluate `source` on the JS thread and wait for the result.
    pub fn eval(&self, source: &str) -> Result<JsValue> {
        if self.is_js_thread() {
            return Err(BridgeError::Unexpected {
                module: "runtime".to_string(),
                function: "eval".to_string(),
                message: "eval would block the JS thread it runs on".to_string(),
            });
        }
        let (sender, receiver) = std_mpsc::channel();
        let source = source.to_string();
        self.schedule(move |engine| {
            let _ = sender.send(engine.eval(&source));
        })?;
        receiver.recv().unwrap_or_else(|_| {
            Err(BridgeError::context_lost(
                "runtime was deallocated before evaluation finished",
            ))
        })
    }

    /// Evaluate `source` and wait until its completion value settles, for
    /// scripts that end in a promise.
    pub fn eval_async(&self, source: &str, timeout: Duration) -> Result<JsValue> {
        if self.is_js_thread() {
            return Err(BridgeError::Unexpected {
                module: "runtime".to_string(),
                function: "eval_async".to_string(),
                message: "eval_async would block the JS thread it runs on".to_string(),
            });
        }
        let (promise, receiver) = Promise::channel();
        let completion = promise.clone();
        let source = source.to_string();
        self.schedule(move |engine| engine.eval_async(&source, promise))?;
        match receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                let timed_out = || BridgeError::Unexpected {
                    module: "runtime".to_string(),
                    function: "eval_async".to_string(),
                    message: format!("script did not settle within {timeout:?}"),
                };
                // Settle the abandoned completion so the engine can drop it on
                // its next pending-job pass.
                completion.reject(timed_out());
                let _ = self.schedule(|engine| engine.run_pending_jobs());
                Err(timed_out())
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(BridgeError::context_lost(
                "runtime was deallocated before evaluation finished",
            )),
        }
    }

    /// Run the engine's garbage collector and wait for it to finish. Shared
    /// objects whose wrappers were collected are released before this returns.
    pub fn collect_garbage(&self) -> Result<()> {
        let (sender, receiver) = std_mpsc::channel();
        self.schedule(move |engine| {
            engine.collect_garbage();
            let _ = sender.send(());
        })?;
        receiver
            .recv()
            .map_err(|_| BridgeError::context_lost("runtime was deallocated during collection"))
    }

    pub fn is_js_thread(&self) -> bool {
        match &*self.lock_state() {
            State::Installed(js) => js.thread == thread::current().id(),
            _ => false,
        }
    }

    /// Tear the runtime down: stop the JS thread, release every shared
    /// object and run all registered cleanup actions. Idempotent.
    pub fn deallocate(&self) {
        let span = self.span();
        let _entered = span.enter();
        {
            let mut state = self.lock_state();
            if matches!(*state, State::Deallocated) {
                tracing::debug!("runtime already deallocated");
                return;
            }
            *state = State::Deallocated;
        }
        let ran = self.inner.deallocator.deallocate();
        tracing::info!(actions = ran, "runtime deallocated");
    }

    /// Route a call to its descriptor and dispatch it.
    ///
    /// Lookup failures and dead runtimes reject `promise`.
    pub fn call(&self, target: &CallTarget, args: Vec<JsValue>, promise: Promise) {
        let span = self.span();
        let _entered = span.enter();
        let rejected = promise.clone();
        if let Err(error) =
            self.with_member(target, |descriptor, ctx| descriptor.call(&ctx, args, promise))
        {
            tracing::debug!(%target, %error, "call could not be routed");
            rejected.reject(error);
        }
    }

    /// Entry point for engines.
    ///
    /// Immediate calls complete before this returns. Everything else gets a
    /// call id whose outcome is delivered later through
    /// [`JsEngine::settle`], as a job on the JS thread.
    pub fn invoke_from_js(&self, target: &CallTarget, args: Vec<JsValue>) -> JsCallOutcome {
        let span = self.span();
        let _entered = span.enter();
        let outcome = self.with_member(target, |descriptor, ctx| {
            if descriptor.returns_promise() {
                let call = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
                descriptor.call(&ctx, args, self.script_promise(call));
                JsCallOutcome::Pending(call)
            } else {
                let (promise, receiver) = Promise::channel();
                descriptor.call(&ctx, args, promise);
                JsCallOutcome::Ready(receiver.try_recv().unwrap_or_else(|_| {
                    Err(BridgeError::Unexpected {
                        module: target.module.clone(),
                        function: target.member.to_string(),
                        message: "immediate call finished without a result".to_string(),
                    })
                }))
            }
        });
        outcome.unwrap_or_else(|error| JsCallOutcome::Ready(Err(error)))
    }

    /// Promise whose outcome is posted back to the JS thread.
    fn script_promise(&self, call: CallId) -> Promise {
        let runtime = self.downgrade();
        Promise::new(move |outcome| {
            let Some(runtime) = runtime.upgrade() else {
                tracing::debug!(call, "runtime is gone; dropping completion");
                return;
            };
            let scheduled = runtime.schedule(move |engine| {
                if let Err(error) = engine.settle(call, outcome) {
                    tracing::warn!(call, %error, "failed to settle script promise");
                }
            });
            if let Err(error) = scheduled {
                tracing::debug!(call, %error, "dropping completion");
            }
        })
    }

    fn with_member<R>(
        &self,
        target: &CallTarget,
        dispatch: impl FnOnce(&FunctionDescriptor, ModuleContext) -> R,
    ) -> Result<R> {
        match &*self.lock_state() {
            State::Installed(_) => {}
            State::Uninstalled => return Err(BridgeError::NotInstalled),
            State::Deallocated => {
                return Err(BridgeError::context_lost("runtime has been deallocated"))
            }
        }
        let app = self.app()?;
        let holder = app
            .modules()
            .get(&target.module)
            .ok_or_else(|| BridgeError::FunctionNotFound {
                module: target.module.clone(),
                function: target.member.to_string(),
            })?;
        let descriptor = holder.definition().member(&target.member)?;
        let ctx = ModuleContext::new(holder.name(), holder.scope(), self.clone());
        Ok(dispatch(descriptor, ctx))
    }

    /// Release a shared object on behalf of the script side.
    pub fn release_object(&self, id: ObjectId) -> bool {
        self.inner.objects.release(id)
    }

    /// Hand a shared object over to `target`.
    ///
    /// The object leaves this runtime's registry without being released and
    /// is registered again in `target` under a new identity.
    pub fn transfer_object(&self, id: ObjectId, target: &Runtime) -> Result<ObjectId> {
        if Arc::ptr_eq(&self.inner, &target.inner) {
            return if self.inner.objects.contains(id) {
                Ok(id)
            } else {
                Err(BridgeError::ObjectNotFound { id })
            };
        }
        let (object, class) = self
            .inner
            .objects
            .detach(id)
            .ok_or(BridgeError::ObjectNotFound { id })?;
        match target.inner.objects.register(object.clone(), class.clone()) {
            Ok(moved) => {
                tracing::debug!(
                    from = self.inner.id,
                    to = target.inner.id,
                    %id,
                    %moved,
                    "shared object transferred"
                );
                Ok(moved)
            }
            Err(error) => {
                if !self.inner.objects.reattach(id, object.clone(), class) {
                    object.on_release();
                }
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

fn run_jobs(engine: &mut dyn JsEngine, mut receiver: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = receiver.blocking_recv() {
        match job {
            Job::Shutdown => break,
            Job::Run(work) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| work(&mut *engine))) {
                    tracing::error!("job panicked on the JS thread: {}", panic_message(payload.as_ref()));
                }
                engine.run_pending_jobs();
            }
        }
    }
}

use crate::executor::BackgroundExecutor;
use crate::module::ModuleDefinition;
use crate::module_registry::{ModuleHandle, ModuleRegistry};
use crate::registration_error::RegistrationError;
use crate::runtime::{Runtime, RuntimeKind, WeakRuntime};
use crate::settings::BridgeSettings;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Application-wide state shared by every runtime: registered modules and
/// the background executor.
///
/// Runtimes only hold a weak reference; once the context is dropped they are
/// deallocated and report context loss.
pub struct AppContext {
    this: Weak<AppContext>,
    settings: BridgeSettings,
    executor: BackgroundExecutor,
    modules: ModuleRegistry,
    primary: OnceCell<Runtime>,
    worklets: Mutex<Vec<WeakRuntime>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn new(settings: BridgeSettings) -> std::io::Result<Arc<Self>> {
        let executor =
            BackgroundExecutor::new(settings.background_threads, &settings.js_thread_name)?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            settings,
            executor,
            modules: ModuleRegistry::new(),
            primary: OnceCell::new(),
            worklets: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn executor(&self) -> &BackgroundExecutor {
        &self.executor
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Register a module. Runtimes installed afterwards expose it.
    pub fn register_module(
        &self,
        definition: ModuleDefinition,
    ) -> Result<ModuleHandle, RegistrationError> {
        self.modules.register(definition)
    }

    pub fn unregister_module(&self, name: &str) -> bool {
        self.modules.unregister(name).is_some()
    }

    /// The primary runtime, created on first use.
    pub fn primary_runtime(&self) -> Runtime {
        self.primary
            .get_or_init(|| self.new_runtime(RuntimeKind::Primary))
            .clone()
    }

    /// A new worklet runtime. The caller owns it; the context only tears it
    /// down on shutdown.
    pub fn create_worklet_runtime(&self) -> Runtime {
        let runtime = self.new_runtime(RuntimeKind::Worklet);
        let mut worklets = self.worklets.lock().unwrap_or_else(|e| e.into_inner());
        worklets.retain(|worklet| worklet.upgrade().is_some());
        worklets.push(runtime.downgrade());
        runtime
    }

    /// Every runtime that is still alive, primary first.
    pub fn runtimes(&self) -> Vec<Runtime> {
        let worklets = self.worklets.lock().unwrap_or_else(|e| e.into_inner());
        self.primary
            .get()
            .cloned()
            .into_iter()
            .chain(worklets.iter().filter_map(WeakRuntime::upgrade))
            .collect()
    }

    fn new_runtime(&self, kind: RuntimeKind) -> Runtime {
        Runtime::new(kind, self.this.clone(), self.executor.clone(), &self.settings)
    }

    /// Cancel every module scope, deallocate all runtimes and stop the
    /// executor. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.modules.cancel_all();
        let runtimes = self.runtimes();
        for runtime in &runtimes {
            runtime.deallocate();
        }
        self.executor.shutdown();
        tracing::info!(runtimes = runtimes.len(), cancelled, "application context shut down");
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::demo_module;

    #[test]
    fn primary_runtime_is_created_once() {
        let app = AppContext::new(BridgeSettings::default()).unwrap();
        let first = app.primary_runtime();
        let second = app.primary_runtime();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.kind(), RuntimeKind::Primary);
    }

    #[test]
    fn worklets_are_tracked_weakly() {
        let app = AppContext::new(BridgeSettings::default()).unwrap();
        let primary = app.primary_runtime();
        let worklet = app.create_worklet_runtime();
        assert_ne!(primary.id(), worklet.id());
        assert_eq!(app.runtimes().len(), 2);

        drop(worklet);
        assert_eq!(app.runtimes().len(), 1);
    }

    #[test]
    fn shutdown_cancels_scopes_and_stops_the_executor() {
        let app = AppContext::new(BridgeSettings::default()).unwrap();
        app.register_module(demo_module()).unwrap();
        let scope = app.modules().get("Demo").unwrap().scope();
        let runtime = app.primary_runtime();

        app.shutdown();
        app.shutdown();
        assert!(!scope.is_active());
        assert!(!app.executor().is_running());
        assert_eq!(runtime.status(), crate::runtime::RuntimeStatus::Deallocated);
    }

    #[test]
    fn modules_can_be_unregistered() {
        let app = AppContext::new(BridgeSettings::default()).unwrap();
        app.register_module(demo_module()).unwrap();
        assert!(matches!(
            app.register_module(demo_module()),
            Err(RegistrationError::DuplicateModule { .. })
        ));
        assert!(app.unregister_module("Demo"));
        assert!(!app.unregister_module("Demo"));
    }
}

use crate::error::{BridgeError, Result};
use crate::executor::BackgroundExecutor;
use crate::runtime::Runtime;
use crate::scope::ModuleScope;
use crate::shared::{ObjectId, SharedObject};
use std::sync::Arc;

/// Everything dispatch needs to know about the module a call targets.
pub struct ModuleContext {
    module: Arc<str>,
    scope: ModuleScope,
    runtime: Runtime,
}

impl ModuleContext {
    pub(crate) fn new(module: &str, scope: ModuleScope, runtime: Runtime) -> Self {
        Self {
            module: Arc::from(module),
            scope,
            runtime,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn scope(&self) -> &ModuleScope {
        &self.scope
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn executor(&self) -> &BackgroundExecutor {
        self.runtime.executor()
    }

    pub(crate) fn call_context(&self, function: &str) -> CallContext {
        CallContext {
            module: self.module.clone(),
            function: Arc::from(function),
            runtime: self.runtime.clone(),
        }
    }
}

/// Handed to native implementations.
#[derive(Clone)]
pub struct CallContext {
    module: Arc<str>,
    function: Arc<str>,
    runtime: Runtime,
}

impl CallContext {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Runtime the call came from.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Register `object` as an instance of `class` in the calling runtime.
    pub fn share<T: SharedObject>(&self, object: T, class: &str) -> Result<ObjectId> {
        self.share_arc(Arc::new(object), class)
    }

    pub fn share_arc(&self, object: Arc<dyn SharedObject>, class: &str) -> Result<ObjectId> {
        let definition = self
            .runtime
            .classes()
            .get(class)
            .ok_or_else(|| BridgeError::UnknownClass {
                name: class.to_string(),
            })?;
        self.runtime.objects().register(object, definition)
    }

    pub fn resolve<T: SharedObject>(&self, id: ObjectId) -> Result<Arc<T>> {
        self.runtime.objects().resolve_as::<T>(id)
    }
}

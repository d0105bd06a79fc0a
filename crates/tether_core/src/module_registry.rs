use crate::module::ModuleDefinition;
use crate::registration_error::RegistrationError;
use crate::scope::ModuleScope;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// Handle assigned to each registered module.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u32);

impl ModuleHandle {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Return the raw index backing this handle.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered module together with its cancellation scope.
pub struct ModuleHolder {
    handle: ModuleHandle,
    definition: ModuleDefinition,
    scope: Mutex<ModuleScope>,
}

impl ModuleHolder {
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    /// Current scope; suspending calls started now run inside it.
    pub fn scope(&self) -> ModuleScope {
        self.lock_scope().clone()
    }

    pub fn cancel_scope(&self) -> usize {
        self.lock_scope().cancel()
    }

    /// Cancel the current scope and start a fresh one.
    pub fn reset_scope(&self) {
        let mut scope = self.lock_scope();
        scope.cancel();
        *scope = ModuleScope::new(self.definition.name());
    }

    fn lock_scope(&self) -> std::sync::MutexGuard<'_, ModuleScope> {
        self.scope.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct Inner {
    modules: Vec<Option<Arc<ModuleHolder>>>,
    name_lookup: HashMap<String, ModuleHandle>,
}

/// Modules known to an application context.
pub struct ModuleRegistry {
    inner: RwLock<Inner>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn register(
        &self,
        definition: ModuleDefinition,
    ) -> Result<ModuleHandle, RegistrationError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let name_key = definition.name().to_string();
        if inner.name_lookup.contains_key(&name_key) {
            return Err(RegistrationError::DuplicateModule { name: name_key });
        }

        let handle = ModuleHandle::new(inner.modules.len() as u32);
        let scope = Mutex::new(ModuleScope::new(&name_key));
        inner.modules.push(Some(Arc::new(ModuleHolder {
            handle,
            definition,
            scope,
        })));
        tracing::info!(module = %name_key, %handle, "module registered");
        inner.name_lookup.insert(name_key, handle);
        Ok(handle)
    }

    /// Remove a module and cancel its in-flight work.
    pub fn unregister(&self, name: &str) -> Option<Arc<ModuleHolder>> {
        let holder = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let handle = inner.name_lookup.remove(name)?;
            inner
                .modules
                .get_mut(handle.index() as usize)
                .and_then(Option::take)
        }?;
        let cancelled = holder.cancel_scope();
        tracing::info!(module = name, cancelled, "module unregistered");
        Some(holder)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleHolder>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let handle = inner.name_lookup.get(name)?;
        inner.modules.get(handle.index() as usize)?.clone()
    }

    pub fn by_handle(&self, handle: ModuleHandle) -> Option<Arc<ModuleHolder>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.modules.get(handle.index() as usize)?.clone()
    }

    /// Registered modules in registration order.
    pub fn holders(&self) -> Vec<Arc<ModuleHolder>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.modules.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .name_lookup
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel the scope of every module. Returns the number of tasks that
    /// were still running.
    pub fn cancel_all(&self) -> usize {
        self.holders()
            .iter()
            .map(|holder| holder.cancel_scope())
            .sum()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

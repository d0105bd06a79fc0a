//! Shared object classes
//!
//! A class bundles an optional constructor with methods and read-only
//! properties whose first argument is the owning shared object.

use crate::context::CallContext;
use crate::convert::{ArgType, Arguments};
use crate::engine::ClassExport;
use crate::function::FunctionDescriptor;
use crate::registration_error::RegistrationError;
use crate::shared::SharedObject;
use crate::value::JsValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

pub(crate) const CONSTRUCTOR: &str = "constructor";

/// Declaration of a class of shared objects.
#[derive(Debug)]
pub struct ClassDefinition {
    name: String,
    constructor: Option<FunctionDescriptor>,
    methods: Vec<FunctionDescriptor>,
    properties: Vec<FunctionDescriptor>,
    constants: Vec<(String, JsValue)>,
}

impl ClassDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            methods: Vec::new(),
            properties: Vec::new(),
            constants: Vec::new(),
        }
    }

    /// Constructor callable from scripts with `new`. The object it returns is
    /// registered with the calling runtime and its identity handed back.
    pub fn with_constructor<T, F>(mut self, arg_types: Vec<ArgType>, construct: F) -> Self
    where
        T: SharedObject,
        F: Fn(&CallContext, Arguments) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let class = self.name.clone();
        let descriptor =
            FunctionDescriptor::immediate(CONSTRUCTOR, arg_types, move |ctx, args| {
                let object = construct(ctx, args)?;
                let id = ctx.share(object, &class)?;
                Ok(JsValue::Shared(id))
            });
        self.constructor = Some(descriptor.owned_by(&self.name));
        self
    }

    /// Method whose implementation receives the owner as argument 0.
    ///
    /// The declared argument types describe the script-visible arguments only;
    /// the owner's type is prepended here.
    pub fn with_method(mut self, descriptor: FunctionDescriptor) -> Self {
        self.methods.push(descriptor.with_receiver(&self.name));
        self
    }

    /// Read-only property computed from the owner.
    pub fn with_property<T, F>(mut self, name: &str, getter: F) -> Self
    where
        T: SharedObject,
        F: Fn(&T) -> anyhow::Result<JsValue> + Send + Sync + 'static,
    {
        let descriptor = FunctionDescriptor::immediate(name, Vec::new(), move |_ctx, args| {
            let owner = args.object::<T>(0)?;
            getter(&owner)
        });
        self.properties.push(descriptor.with_receiver(&self.name));
        self
    }

    pub fn with_constant(mut self, name: &str, value: impl Into<JsValue>) -> Self {
        self.constants.push((name.to_string(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constructor(&self) -> Option<&FunctionDescriptor> {
        self.constructor.as_ref()
    }

    pub fn method(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.methods.iter().find(|method| method.name() == name)
    }

    pub fn getter(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.properties.iter().find(|property| property.name() == name)
    }

    pub fn methods(&self) -> &[FunctionDescriptor] {
        &self.methods
    }

    pub fn properties(&self) -> &[FunctionDescriptor] {
        &self.properties
    }

    pub fn constants(&self) -> &[(String, JsValue)] {
        &self.constants
    }

    pub(crate) fn validate(&self) -> Result<(), RegistrationError> {
        if self.name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        let mut seen = HashSet::new();
        let members = self
            .methods
            .iter()
            .chain(&self.properties)
            .map(|descriptor| descriptor.name())
            .chain(self.constants.iter().map(|(name, _)| name.as_str()));
        for name in members {
            if name.is_empty() {
                return Err(RegistrationError::EmptyName);
            }
            if name == CONSTRUCTOR || name.starts_with("__") {
                return Err(RegistrationError::ReservedName {
                    name: name.to_string(),
                });
            }
            if !seen.insert(name) {
                return Err(RegistrationError::DuplicateClassMember {
                    class: self.name.clone(),
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn export(&self) -> ClassExport {
        ClassExport {
            name: self.name.clone(),
            constructor: self.constructor.as_ref().map(FunctionDescriptor::export),
            methods: self.methods.iter().map(FunctionDescriptor::export).collect(),
            properties: self
                .properties
                .iter()
                .map(|property| property.name().to_string())
                .collect(),
            constants: self.constants.clone(),
        }
    }
}

/// Per-runtime table of known classes, keyed by name.
///
/// Filled while a runtime installs and sealed afterwards.
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, Arc<ClassDefinition>>>,
    sealed: AtomicBool,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a class. Each class may be registered once per runtime.
    pub fn register(&self, class: Arc<ClassDefinition>) -> Result<(), RegistrationError> {
        let mut classes = self.classes.write().unwrap_or_else(|e| e.into_inner());
        if self.sealed.load(Ordering::Acquire) {
            return Err(RegistrationError::Sealed {
                name: class.name().to_string(),
            });
        }
        if classes.contains_key(class.name()) {
            return Err(RegistrationError::DuplicateClass {
                name: class.name().to_string(),
            });
        }
        tracing::debug!(class = class.name(), "registered class");
        classes.insert(class.name().to_string(), class);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassDefinition>> {
        self.classes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.classes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Forget every class and accept registrations again.
    pub fn clear(&self) {
        let mut classes = self.classes.write().unwrap_or_else(|e| e.into_inner());
        classes.clear();
        self.sealed.store(false, Ordering::Release);
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

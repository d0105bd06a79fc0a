//! Module declarations
//!
//! A module is a named bundle of functions, constants and classes exposed to
//! scripts under `<namespace>.modules.<name>`.

use crate::class::ClassDefinition;
use crate::engine::ModuleExport;
use crate::error::{BridgeError, Result};
use crate::function::FunctionDescriptor;
use crate::registration_error::RegistrationError;
use crate::runtime::Member;
use crate::value::JsValue;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Lazily computed constant, evaluated each time a runtime installs.
pub type ConstantProvider = Arc<dyn Fn() -> JsValue + Send + Sync>;

pub struct ModuleDefinition {
    name: String,
    functions: Vec<FunctionDescriptor>,
    function_lookup: HashMap<String, usize>,
    constants: Vec<(String, ConstantProvider)>,
    classes: Vec<Arc<ClassDefinition>>,
}

impl ModuleDefinition {
    pub fn builder(name: &str) -> ModuleBuilder {
        ModuleBuilder {
            name: name.to_string(),
            functions: Vec::new(),
            constants: Vec::new(),
            classes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.function_lookup
            .get(name)
            .and_then(|index| self.functions.get(*index))
    }

    pub fn functions(&self) -> &[FunctionDescriptor] {
        &self.functions
    }

    pub fn class(&self, name: &str) -> Option<&Arc<ClassDefinition>> {
        self.classes.iter().find(|class| class.name() == name)
    }

    pub fn classes(&self) -> &[Arc<ClassDefinition>] {
        &self.classes
    }

    /// Evaluate every constant provider.
    pub fn constants(&self) -> Vec<(String, JsValue)> {
        self.constants
            .iter()
            .map(|(name, provider)| (name.clone(), provider()))
            .collect()
    }

    /// Descriptor behind a script-visible member.
    pub fn member(&self, member: &Member) -> Result<&FunctionDescriptor> {
        let found = match member {
            Member::Function(name) => self.function(name),
            Member::Constructor { class } => self.class(class).and_then(|c| c.constructor()),
            Member::Method { class, name } => self.class(class).and_then(|c| c.method(name)),
            Member::Getter { class, name } => self.class(class).and_then(|c| c.getter(name)),
        };
        found.ok_or_else(|| BridgeError::FunctionNotFound {
            module: self.name.clone(),
            function: member.to_string(),
        })
    }

    pub fn export(&self) -> ModuleExport {
        ModuleExport {
            name: self.name.clone(),
            functions: self.functions.iter().map(FunctionDescriptor::export).collect(),
            constants: self.constants(),
            classes: self.classes.iter().map(|class| class.export()).collect(),
        }
    }
}

impl fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("name", &self.name)
            .field("functions", &self.functions)
            .field(
                "constants",
                &self.constants.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("classes", &self.classes)
            .finish()
    }
}

/// Collects a module's members; [`ModuleBuilder::build`] validates them.
pub struct ModuleBuilder {
    name: String,
    functions: Vec<FunctionDescriptor>,
    constants: Vec<(String, ConstantProvider)>,
    classes: Vec<ClassDefinition>,
}

impl ModuleBuilder {
    pub fn function(mut self, descriptor: FunctionDescriptor) -> Self {
        self.functions.push(descriptor);
        self
    }

    pub fn constant(mut self, name: &str, value: impl Into<JsValue>) -> Self {
        let value = value.into();
        self.constants
            .push((name.to_string(), Arc::new(move || value.clone())));
        self
    }

    pub fn constant_with<F>(mut self, name: &str, provider: F) -> Self
    where
        F: Fn() -> JsValue + Send + Sync + 'static,
    {
        self.constants.push((name.to_string(), Arc::new(provider)));
        self
    }

    pub fn class(mut self, class: ClassDefinition) -> Self {
        self.classes.push(class);
        self
    }

    pub fn build(self) -> std::result::Result<ModuleDefinition, RegistrationError> {
        if self.name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        let mut seen = HashSet::new();
        let names = self
            .functions
            .iter()
            .map(FunctionDescriptor::name)
            .chain(self.constants.iter().map(|(name, _)| name.as_str()))
            .chain(self.classes.iter().map(ClassDefinition::name));
        for name in names {
            if name.is_empty() {
                return Err(RegistrationError::EmptyName);
            }
            if name.starts_with("__") {
                return Err(RegistrationError::ReservedName {
                    name: name.to_string(),
                });
            }
            if !seen.insert(name) {
                return Err(RegistrationError::DuplicateMember {
                    module: self.name.clone(),
                    name: name.to_string(),
                });
            }
        }
        for class in &self.classes {
            class.validate()?;
        }

        let function_lookup = self
            .functions
            .iter()
            .enumerate()
            .map(|(index, function)| (function.name().to_string(), index))
            .collect();
        Ok(ModuleDefinition {
            name: self.name,
            functions: self.functions,
            function_lookup,
            constants: self.constants,
            classes: self.classes.into_iter().map(Arc::new).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ArgType;
    use crate::function::DispatchKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn echo(name: &str) -> FunctionDescriptor {
        FunctionDescriptor::immediate(name, vec![ArgType::Any], |_ctx, args| {
            Ok(args.raw(0)?.clone())
        })
    }

    #[test]
    fn build_indexes_functions() {
        let module = ModuleDefinition::builder("Echo")
            .function(echo("echo"))
            .function(echo("again"))
            .build()
            .unwrap();
        assert_eq!(module.function("again").unwrap().name(), "again");
        assert!(module.function("missing").is_none());
        assert!(module.member(&Member::Function("echo".into())).is_ok());
        let error = module
            .member(&Member::Method {
                class: "Nope".into(),
                name: "x".into(),
            })
            .unwrap_err();
        assert_eq!(error.code(), "ERR_FUNCTION_NOT_FOUND");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ModuleDefinition::builder("Echo")
            .function(echo("echo"))
            .constant("echo", 1)
            .build();
        assert!(matches!(
            result,
            Err(RegistrationError::DuplicateMember { .. })
        ));

        let result = ModuleDefinition::builder("Echo").function(echo("__tether")).build();
        assert!(matches!(result, Err(RegistrationError::ReservedName { .. })));

        assert_eq!(
            ModuleDefinition::builder("").build().unwrap_err(),
            RegistrationError::EmptyName
        );
    }

    #[test]
    fn constants_are_evaluated_per_export() {
        let counter = Arc::new(AtomicU32::new(0));
        let provider = counter.clone();
        let module = ModuleDefinition::builder("Env")
            .constant("NAME", "env")
            .constant_with("GENERATION", move || {
                JsValue::from(provider.fetch_add(1, Ordering::SeqCst) as i64)
            })
            .build()
            .unwrap();

        let first = module.export();
        let second = module.export();
        assert_eq!(first.constants[0], ("NAME".to_string(), JsValue::from("env")));
        assert_eq!(first.constants[1].1, JsValue::from(0));
        assert_eq!(second.constants[1].1, JsValue::from(1));
    }

    #[test]
    fn export_describes_functions_and_classes() {
        let module = ModuleDefinition::builder("Mixed")
            .function(echo("echo"))
            .function(FunctionDescriptor::scheduled("later", vec![], |_ctx, _args| {
                Ok(JsValue::Null)
            }))
            .class(ClassDefinition::new("Thing"))
            .build()
            .unwrap();
        let export = module.export();
        assert_eq!(export.functions.len(), 2);
        assert_eq!(export.functions[1].kind, DispatchKind::ScheduledAsync);
        assert_eq!(export.classes[0].name, "Thing");
        assert!(export.classes[0].constructor.is_none());
    }
}

//! Tether Core
//!
//! The native side of the JS bridge:
//! - Runtimes (primary and worklet) with their JS thread
//! - Function dispatch with argument conversion
//! - Shared object and class registries
//! - Ordered teardown through the deallocator

pub mod app;
pub mod class;
pub mod context;
pub mod convert;
pub mod dealloc;
pub mod engine;
pub mod error;
pub mod executor;
pub mod function;
pub mod module;
pub mod module_registry;
pub mod promise;
pub mod registration_error;
pub mod runtime;
pub mod scope;
pub mod settings;
pub mod shared;
pub mod value;

#[cfg(test)]
mod testing;

pub use app::AppContext;
pub use class::{ClassDefinition, ClassRegistry};
pub use context::{CallContext, ModuleContext};
pub use convert::{ArgType, ArgumentConverter, Arguments, ConversionContext, NativeValue, SharedRef};
pub use dealloc::{CleanupHandle, Deallocator};
pub use engine::{CallId, ClassExport, EngineBindings, FunctionExport, JsCallOutcome, JsEngine, ModuleExport};
pub use error::{BridgeError, ConversionError, ErrorKind, Exception, Result};
pub use executor::BackgroundExecutor;
pub use function::{DispatchKind, FunctionDescriptor};
pub use module::{ModuleBuilder, ModuleDefinition};
pub use module_registry::{ModuleHandle, ModuleHolder, ModuleRegistry};
pub use promise::{Promise, Settlement};
pub use registration_error::RegistrationError;
pub use runtime::{CallTarget, Member, Runtime, RuntimeKind, RuntimeStatus, WeakRuntime};
pub use scope::ModuleScope;
pub use settings::{BridgeSettings, SettingsError};
pub use shared::{downcast_shared, ObjectId, SharedObject, SharedObjectRegistry};
pub use value::{JsValue, OBJECT_ID_KEY};

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

//! Seam between the bridge and a JavaScript engine
//!
//! An engine lives on its runtime's JS thread and is only ever touched from
//! there. It forwards script calls to [`Runtime::invoke_from_js`] and
//! receives asynchronous outcomes through [`JsEngine::settle`].
//!
//! [`Runtime::invoke_from_js`]: crate::runtime::Runtime::invoke_from_js

use crate::error::Result;
use crate::function::DispatchKind;
use crate::promise::{Promise, Settlement};
use crate::runtime::WeakRuntime;
use crate::value::JsValue;

/// Identifies a pending script-side promise.
pub type CallId = u64;

/// What a script call produces right away.
#[derive(Debug)]
pub enum JsCallOutcome {
    /// Immediate call; return the value or throw the error.
    Ready(Settlement),
    /// Hand the script a promise; its outcome arrives through
    /// [`JsEngine::settle`] with the same id.
    Pending(CallId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExport {
    pub name: String,
    pub kind: DispatchKind,
    /// Script-visible argument count.
    pub arity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassExport {
    pub name: String,
    pub constructor: Option<FunctionExport>,
    pub methods: Vec<FunctionExport>,
    pub properties: Vec<String>,
    pub constants: Vec<(String, JsValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleExport {
    pub name: String,
    pub functions: Vec<FunctionExport>,
    pub constants: Vec<(String, JsValue)>,
    pub classes: Vec<ClassExport>,
}

/// Everything an engine needs to expose the installed modules.
pub struct EngineBindings {
    pub runtime: WeakRuntime,
    /// Global object the modules hang off, `<namespace>.modules.<name>`.
    pub namespace: String,
    pub modules: Vec<ModuleExport>,
}

pub trait JsEngine: 'static {
    /// Install the module objects into the global scope.
    fn bind(&mut self, bindings: EngineBindings) -> Result<()>;

    /// Evaluate a script and return its completion value.
    fn eval(&mut self, source: &str) -> Result<JsValue>;

    /// Evaluate a script and settle `completion` with its completion value.
    /// Engines with native promises wait for a returned promise to settle.
    fn eval_async(&mut self, source: &str, completion: Promise) {
        completion.settle(self.eval(source));
    }

    /// Resolve or reject the script promise behind `call`.
    fn settle(&mut self, call: CallId, outcome: Settlement) -> Result<()>;

    /// Run queued microtasks. Called after every job on the JS thread.
    fn run_pending_jobs(&mut self) {}

    /// Force a collection cycle.
    fn collect_garbage(&mut self) {}
}

//! Fixtures shared by the unit tests: an in-memory engine and a demo module.

use crate::class::ClassDefinition;
use crate::convert::ArgType;
use crate::engine::{CallId, EngineBindings, JsCallOutcome, JsEngine};
use crate::error::{BridgeError, Exception, Result};
use crate::function::FunctionDescriptor;
use crate::module::ModuleDefinition;
use crate::promise::Settlement;
use crate::runtime::{CallTarget, Runtime, WeakRuntime};
use crate::shared::SharedObject;
use crate::value::JsValue;
use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Engine that understands JSON literals and `call Module.function [args]`.
pub(crate) struct ScriptedEngine {
    runtime: Option<WeakRuntime>,
    settled: mpsc::Sender<(CallId, Settlement)>,
}

impl JsEngine for ScriptedEngine {
    fn bind(&mut self, bindings: EngineBindings) -> Result<()> {
        self.runtime = Some(bindings.runtime);
        Ok(())
    }

    fn eval(&mut self, source: &str) -> Result<JsValue> {
        if let Some(call) = source.strip_prefix("call ") {
            return self.call(call);
        }
        serde_json::from_str::<serde_json::Value>(source)
            .map(JsValue::from)
            .map_err(|error| BridgeError::JavaScript {
                message: error.to_string(),
            })
    }

    fn settle(&mut self, call: CallId, outcome: Settlement) -> Result<()> {
        let _ = self.settled.send((call, outcome));
        Ok(())
    }
}

impl ScriptedEngine {
    fn call(&mut self, call: &str) -> Result<JsValue> {
        let syntax = || BridgeError::JavaScript {
            message: format!("cannot parse call '{call}'"),
        };
        let (path, args) = call.split_once(' ').ok_or_else(syntax)?;
        let (module, function) = path.split_once('.').ok_or_else(syntax)?;
        let args = match self.eval(args)? {
            JsValue::Array(args) => args,
            _ => return Err(syntax()),
        };
        let runtime = self
            .runtime
            .as_ref()
            .and_then(WeakRuntime::upgrade)
            .ok_or_else(|| BridgeError::context_lost("runtime is gone"))?;
        match runtime.invoke_from_js(&CallTarget::function(module, function), args) {
            JsCallOutcome::Ready(outcome) => outcome,
            JsCallOutcome::Pending(id) => Ok(JsValue::object([("pending", JsValue::from(id as i64))])),
        }
    }
}

/// Install a [`ScriptedEngine`] and return the receiver of its settlements.
pub(crate) fn install_scripted(runtime: &Runtime) -> mpsc::Receiver<(CallId, Settlement)> {
    let (sender, receiver) = mpsc::channel();
    runtime
        .install(move || {
            Ok(Box::new(ScriptedEngine {
                runtime: None,
                settled: sender,
            }) as Box<dyn JsEngine>)
        })
        .unwrap();
    receiver
}

pub(crate) struct Counter {
    value: AtomicI64,
    released: Option<Arc<AtomicBool>>,
}

impl Counter {
    pub(crate) fn new(value: i64) -> Self {
        Self {
            value: AtomicI64::new(value),
            released: None,
        }
    }

    pub(crate) fn with_release_flag(value: i64, released: Arc<AtomicBool>) -> Self {
        Self {
            value: AtomicI64::new(value),
            released: Some(released),
        }
    }
}

impl SharedObject for Counter {
    fn on_release(&self) {
        if let Some(released) = &self.released {
            released.store(true, Ordering::SeqCst);
        }
    }
}

pub(crate) fn demo_module() -> ModuleDefinition {
    let counter = ClassDefinition::new("Counter")
        .with_constructor(vec![ArgType::Integer], |_ctx, args| {
            Ok(Counter::new(args.integer(0)?))
        })
        .with_method(FunctionDescriptor::immediate(
            "increment",
            vec![],
            |_ctx, args| {
                let counter = args.object::<Counter>(0)?;
                Ok(JsValue::from(counter.value.fetch_add(1, Ordering::SeqCst) + 1))
            },
        ))
        .with_property("value", |counter: &Counter| {
            Ok(JsValue::from(counter.value.load(Ordering::SeqCst)))
        });

    ModuleDefinition::builder("Demo")
        .function(FunctionDescriptor::immediate(
            "add",
            vec![ArgType::Number, ArgType::Number],
            |_ctx, args| Ok(JsValue::from(args.number(0)? + args.number(1)?)),
        ))
        .function(FunctionDescriptor::scheduled(
            "slowEcho",
            vec![ArgType::String],
            |_ctx, args| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(JsValue::from(args.string(0)?))
            },
        ))
        .function(FunctionDescriptor::suspending(
            "fetchValue",
            vec![],
            |_ctx, _args| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(JsValue::from(42))
            },
        ))
        .function(FunctionDescriptor::scheduled_with_promise(
            "defer",
            vec![ArgType::Integer],
            |_ctx, args, promise| {
                let n = args.integer(0)?;
                if n < 0 {
                    return Err(Exception::new("ERR_NEGATIVE", "expected a positive number").into());
                }
                std::thread::spawn(move || {
                    promise.resolve(n * 2);
                });
                Ok(())
            },
        ))
        .function(FunctionDescriptor::immediate(
            "fail",
            vec![ArgType::String],
            |_ctx, args| Err(Exception::new(args.string(0)?, "failed on purpose").into()),
        ))
        .function(FunctionDescriptor::immediate("explode", vec![], |_ctx, _args| {
            Err(anyhow!("untyped failure"))
        }))
        .class(counter)
        .build()
        .unwrap()
}

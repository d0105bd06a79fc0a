//! Demo module exposed by the `tether` binary

use anyhow::Context as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_core::{
    ArgType, ClassDefinition, Exception, FunctionDescriptor, JsValue, ModuleDefinition,
    RegistrationError, SharedObject,
};

pub struct Counter {
    value: AtomicI64,
}

impl SharedObject for Counter {
    fn on_release(&self) {
        tracing::debug!(value = self.value.load(Ordering::SeqCst), "counter released");
    }
}

fn counter_class() -> ClassDefinition {
    ClassDefinition::new("Counter")
        .with_constructor(vec![ArgType::Integer], |_ctx, args| {
            Ok(Counter {
                value: AtomicI64::new(args.integer(0)?),
            })
        })
        .with_method(FunctionDescriptor::immediate(
            "increment",
            vec![ArgType::optional(ArgType::Integer)],
            |_ctx, args| {
                let counter = args.object::<Counter>(0)?;
                let step = match args.optional(1)? {
                    Some(_) => args.integer(1)?,
                    None => 1,
                };
                Ok(JsValue::from(counter.value.fetch_add(step, Ordering::SeqCst) + step))
            },
        ))
        .with_property("value", |counter: &Counter| {
            Ok(JsValue::from(counter.value.load(Ordering::SeqCst)))
        })
        .with_constant("MAX", JsValue::from(i32::MAX))
}

pub fn module() -> Result<ModuleDefinition, RegistrationError> {
    ModuleDefinition::builder("Demo")
        .function(FunctionDescriptor::immediate(
            "add",
            vec![ArgType::Number, ArgType::Number],
            |_ctx, args| Ok(JsValue::from(args.number(0)? + args.number(1)?)),
        ))
        .function(FunctionDescriptor::scheduled(
            "slowEcho",
            vec![ArgType::String, ArgType::optional(ArgType::Integer)],
            |_ctx, args| {
                let delay = match args.optional(1)? {
                    Some(_) => args.integer(1)?,
                    None => 100,
                };
                let delay = u64::try_from(delay)
                    .map_err(|_| Exception::new("ERR_INVALID_DELAY", "delay must not be negative"))?;
                std::thread::sleep(Duration::from_millis(delay));
                Ok(JsValue::from(args.string(0)?))
            },
        ))
        .function(FunctionDescriptor::suspending(
            "fetchValue",
            vec![ArgType::String],
            |_ctx, args| async move {
                let key = args.string(0)?.to_string();
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, anyhow::Error>(JsValue::object([
                    ("key", JsValue::from(key)),
                    ("value", JsValue::from(42)),
                ]))
            },
        ))
        .function(FunctionDescriptor::immediate("now", vec![], |_ctx, _args| {
            let elapsed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("system clock is before the epoch")?;
            Ok(JsValue::from(elapsed.as_millis() as f64))
        }))
        .constant("name", JsValue::from("tether demo"))
        .class(counter_class())
        .build()
}

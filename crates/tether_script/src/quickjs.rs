//! QuickJS engine
//!
//! Implements [`JsEngine`] on top of rquickjs. Native entry points are plain
//! functions taking strings; the prelude builds the module objects, promises
//! and shared-object wrappers around them.

use crate::envelope;
use crate::handle::LiveObjects;
use rquickjs::{Class, Context, Ctx, Function, Runtime, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tether_core::{
    BridgeError, CallId, EngineBindings, JsEngine, JsValue, ObjectId, Promise, Result,
    Settlement, WeakRuntime,
};

const PRELUDE: &str = include_str!("prelude.js");

type Evaluations = Rc<RefCell<HashMap<u64, Promise>>>;

/// QuickJS context bound to one bridge runtime.
pub struct QuickJsEngine {
    context: Context,
    runtime: Runtime,
    bridge: Option<WeakRuntime>,
    evaluations: Evaluations,
    next_evaluation: u64,
    live: Rc<LiveObjects>,
}

impl QuickJsEngine {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().map_err(engine_error)?;
        let context = Context::full(&runtime).map_err(engine_error)?;
        Ok(Self {
            context,
            runtime,
            bridge: None,
            evaluations: Rc::new(RefCell::new(HashMap::new())),
            next_evaluation: 1,
            live: Rc::new(LiveObjects::default()),
        })
    }

    /// Factory for [`tether_core::Runtime::install`]. The engine is created
    /// on the JS thread.
    pub fn factory() -> impl FnOnce() -> Result<Box<dyn JsEngine>> + Send + 'static {
        || Ok(Box::new(QuickJsEngine::new()?) as Box<dyn JsEngine>)
    }

    fn upgrade(&self) -> Option<tether_core::Runtime> {
        self.bridge.as_ref().and_then(WeakRuntime::upgrade)
    }

    /// Release the objects whose last wrapper was collected.
    fn release_collected(&self) {
        let released = self.live.take_released();
        if released.is_empty() {
            return;
        }
        let Some(runtime) = self.upgrade() else {
            return;
        };
        let count = released
            .into_iter()
            .filter(|id| runtime.release_object(ObjectId::from_raw(*id)))
            .count();
        tracing::trace!(count, "released collected shared objects");
    }
}

impl JsEngine for QuickJsEngine {
    fn bind(&mut self, bindings: EngineBindings) -> Result<()> {
        let exports = envelope::exports(&bindings.modules).to_string();
        let namespace = bindings.namespace;
        let runtime = bindings.runtime;
        let evaluations = self.evaluations.clone();
        let live = self.live.clone();
        self.bridge = Some(runtime.clone());

        self.context.with(|ctx| {
            let installed = (|| -> rquickjs::Result<()> {
                install_natives(&ctx, &runtime, evaluations, live)?;
                ctx.eval::<(), _>(PRELUDE)?;
                let install: Function = ctx.globals().get("__tether_install")?;
                install.call::<_, ()>((namespace.as_str(), exports))
            })();
            installed.map_err(|error| exception(&ctx, error))
        })
    }

    fn eval(&mut self, source: &str) -> Result<JsValue> {
        self.context.with(|ctx| {
            let encoded = (|| -> rquickjs::Result<String> {
                let value: Value = ctx.eval(source)?;
                let encode: Function = ctx.globals().get("__tether_encode")?;
                encode.call((value,))
            })();
            let json = encoded.map_err(|error| exception(&ctx, error))?;
            envelope::decode_result(&json)
        })
    }

    fn eval_async(&mut self, source: &str, completion: Promise) {
        let id = self.next_evaluation;
        self.next_evaluation += 1;
        self.evaluations.borrow_mut().insert(id, completion.clone());

        let tracked = self.context.with(|ctx| {
            let tracked = (|| -> rquickjs::Result<()> {
                let value: Value = ctx.eval(source)?;
                let track: Function = ctx.globals().get("__tether_await")?;
                track.call::<_, ()>((id as f64, value))
            })();
            tracked.map_err(|error| exception(&ctx, error))
        });
        if let Err(error) = tracked {
            self.evaluations.borrow_mut().remove(&id);
            completion.reject(error);
        }
    }

    fn settle(&mut self, call: CallId, outcome: Settlement) -> Result<()> {
        let runtime = self.upgrade();
        let json = envelope::settlement(runtime.as_ref(), &outcome).to_string();
        self.context.with(|ctx| {
            let settled = (|| -> rquickjs::Result<()> {
                let settle: Function = ctx.globals().get("__tether_settle")?;
                settle.call::<_, ()>((call as f64, json))
            })();
            settled.map_err(|error| exception(&ctx, error))
        })
    }

    fn run_pending_jobs(&mut self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => tracing::warn!("uncaught exception in a script job"),
            }
        }
        // Completions settled from the host side (timeouts) are never awaited again.
        self.evaluations
            .borrow_mut()
            .retain(|_, completion| !completion.is_settled());
        self.release_collected();
    }

    fn collect_garbage(&mut self) {
        self.runtime.run_gc();
        self.release_collected();
    }
}

fn install_natives<'js>(
    ctx: &Ctx<'js>,
    runtime: &WeakRuntime,
    evaluations: Evaluations,
    live: Rc<LiveObjects>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let caller = runtime.clone();
    globals.set(
        "__tether_call",
        Function::new(
            ctx.clone(),
            move |module: String, kind: String, class: String, name: String, args: String| {
                dispatch(&caller, module, &kind, class, name, &args)
            },
        )?,
    )?;

    let releaser = runtime.clone();
    globals.set(
        "__tether_release",
        Function::new(ctx.clone(), move |id: f64| {
            releaser
                .upgrade()
                .map(|runtime| runtime.release_object(ObjectId::from_raw(id as u64)))
                .unwrap_or(false)
        })?,
    )?;

    globals.set(
        "__tether_handle",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: f64| {
            Class::instance(ctx, live.handle(id as u64))
        })?,
    )?;

    globals.set(
        "__tether_done",
        Function::new(ctx.clone(), move |id: f64, json: String| {
            let completion = evaluations.borrow_mut().remove(&(id as u64));
            if let Some(completion) = completion {
                completion.settle(envelope::decode_result(&json));
            }
        })?,
    )?;
    Ok(())
}

fn dispatch(
    runtime: &WeakRuntime,
    module: String,
    kind: &str,
    class: String,
    name: String,
    args: &str,
) -> String {
    let Some(runtime) = runtime.upgrade() else {
        return envelope::failure(&BridgeError::context_lost("runtime is gone")).to_string();
    };
    let call = envelope::target(module, kind, class, name)
        .and_then(|target| Ok((target, envelope::decode_args(args)?)));
    match call {
        Ok((target, args)) => {
            let outcome = runtime.invoke_from_js(&target, args);
            envelope::outcome(&runtime, outcome).to_string()
        }
        Err(error) => envelope::failure(&error).to_string(),
    }
}

fn engine_error(error: rquickjs::Error) -> BridgeError {
    BridgeError::JavaScript {
        message: error.to_string(),
    }
}

/// Turn a failed QuickJS call into a bridge error, draining the pending
/// exception if there is one.
fn exception(ctx: &Ctx<'_>, error: rquickjs::Error) -> BridgeError {
    if !matches!(error, rquickjs::Error::Exception) {
        return engine_error(error);
    }
    let thrown = ctx.catch();
    let described = ctx
        .globals()
        .get::<_, Function>("__tether_describe")
        .and_then(|describe| describe.call::<_, String>((thrown.clone(),)));
    let message = match described {
        Ok(message) => message,
        Err(_) => thrown
            .as_object()
            .and_then(|object| object.get::<_, String>("message").ok())
            .unwrap_or_else(|| "uncaught exception".to_string()),
    };
    BridgeError::JavaScript { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tether_core::{
        AppContext, ArgType, BridgeSettings, ClassDefinition, ErrorKind, Exception,
        FunctionDescriptor, ModuleDefinition, SharedObject,
    };

    const WAIT: Duration = Duration::from_secs(5);

    struct Counter(AtomicI64);

    impl SharedObject for Counter {}

    fn module() -> ModuleDefinition {
        let counter = ClassDefinition::new("Counter")
            .with_constructor(vec![ArgType::Integer], |_ctx, args| {
                Ok(Counter(AtomicI64::new(args.integer(0)?)))
            })
            .with_method(FunctionDescriptor::immediate("increment", vec![], |_ctx, args| {
                let counter = args.object::<Counter>(0)?;
                Ok(JsValue::from(counter.0.fetch_add(1, Ordering::SeqCst) + 1))
            }))
            .with_method(FunctionDescriptor::immediate("itself", vec![], |_ctx, args| {
                Ok(JsValue::Shared(args.shared(0)?.id()))
            }))
            .with_property("value", |counter: &Counter| {
                Ok(JsValue::from(counter.0.load(Ordering::SeqCst)))
            })
            .with_constant("LIMIT", JsValue::from(100));

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
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(JsValue::from(args.string(0)?))
                },
            ))
            .function(FunctionDescriptor::suspending(
                "fetchValue",
                vec![],
                |_ctx, _args| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(JsValue::from(42))
                },
            ))
            .function(FunctionDescriptor::immediate(
                "fail",
                vec![ArgType::String],
                |_ctx, args| Err(Exception::new(args.string(0)?, "failed on purpose").into()),
            ))
            .constant("VERSION", JsValue::from("1.0"))
            .class(counter)
            .build()
            .unwrap()
    }

    fn installed(settings: BridgeSettings) -> (Arc<AppContext>, tether_core::Runtime) {
        let app = AppContext::new(settings).unwrap();
        app.register_module(module()).unwrap();
        let runtime = app.primary_runtime();
        runtime.install(QuickJsEngine::factory()).unwrap();
        (app, runtime)
    }

    fn demo() -> (Arc<AppContext>, tether_core::Runtime) {
        installed(BridgeSettings::default())
    }

    #[test]
    fn evaluates_plain_scripts() {
        let (_app, runtime) = demo();
        assert_eq!(runtime.eval("1 + 2").unwrap(), JsValue::from(3));
        assert_eq!(runtime.eval("undefined").unwrap(), JsValue::Undefined);
        assert_eq!(
            runtime.eval("({ a: [1, 'x', null] })").unwrap(),
            JsValue::object([(
                "a",
                JsValue::Array(vec![JsValue::from(1), JsValue::from("x"), JsValue::Null])
            )])
        );
    }

    #[test]
    fn modules_hang_off_the_namespace() {
        let (_app, runtime) = demo();
        assert_eq!(
            runtime.eval("typeof tether.modules.Demo.add").unwrap(),
            JsValue::from("function")
        );
        assert_eq!(runtime.eval("tether.modules.Demo.add.length").unwrap(), JsValue::from(2));
        assert_eq!(runtime.eval("tether.modules.Demo.VERSION").unwrap(), JsValue::from("1.0"));
    }

    #[test]
    fn namespace_follows_settings() {
        let settings = BridgeSettings {
            namespace: "bridge".to_string(),
            ..BridgeSettings::default()
        };
        let (_app, runtime) = installed(settings);
        assert_eq!(
            runtime.eval("typeof bridge.modules.Demo").unwrap(),
            JsValue::from("object")
        );
    }

    #[test]
    fn immediate_calls_return_synchronously() {
        let (_app, runtime) = demo();
        assert_eq!(runtime.eval("tether.modules.Demo.add(2, 3)").unwrap(), JsValue::from(5));
    }

    #[test]
    fn arity_errors_are_thrown_with_a_code() {
        let (_app, runtime) = demo();
        let code = runtime
            .eval("try { tether.modules.Demo.add(2); 'no error' } catch (e) { [e.code, e.kind] }")
            .unwrap();
        assert_eq!(
            code,
            JsValue::Array(vec![
                JsValue::from("ERR_INVALID_ARGS_NUMBER"),
                JsValue::from("ArityError")
            ])
        );
    }

    #[test]
    fn implementation_codes_reach_the_script() {
        let (_app, runtime) = demo();
        let code = runtime
            .eval("try { tether.modules.Demo.fail('ERR_CUSTOM') } catch (e) { e.code }")
            .unwrap();
        assert_eq!(code, JsValue::from("ERR_CUSTOM"));
    }

    #[test]
    fn uncaught_errors_surface_as_javascript_errors() {
        let (_app, runtime) = demo();
        let error = runtime.eval("tether.modules.Demo.add(1)").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::JavaScript);
        assert!(error.to_string().contains("ERR_INVALID_ARGS_NUMBER"));

        let error = runtime.eval("this is not javascript").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::JavaScript);
    }

    #[test]
    fn scheduled_calls_resolve_promises() {
        let (_app, runtime) = demo();
        assert_eq!(
            runtime.eval("tether.modules.Demo.slowEcho('hi') instanceof Promise").unwrap(),
            JsValue::from(true)
        );
        let value = runtime
            .eval_async("tether.modules.Demo.slowEcho('hi')", WAIT)
            .unwrap();
        assert_eq!(value, JsValue::from("hi"));
    }

    #[test]
    fn async_conversion_errors_reject() {
        let (_app, runtime) = demo();
        let code = runtime
            .eval_async("tether.modules.Demo.slowEcho(1).catch((e) => e.code)", WAIT)
            .unwrap();
        assert_eq!(code, JsValue::from("ERR_ARGUMENT_CAST"));

        let error = runtime
            .eval_async("tether.modules.Demo.slowEcho(1)", WAIT)
            .unwrap_err();
        assert!(error.to_string().contains("ERR_ARGUMENT_CAST"));
    }

    #[test]
    fn suspending_calls_resolve_promises() {
        let (_app, runtime) = demo();
        let value = runtime
            .eval_async("tether.modules.Demo.fetchValue().then((v) => v + 1)", WAIT)
            .unwrap();
        assert_eq!(value, JsValue::from(43));
    }

    #[test]
    fn classes_construct_shared_objects() {
        let (_app, runtime) = demo();
        let result = runtime
            .eval(
                "const { Counter } = tether.modules.Demo;
                 const counter = new Counter(1);
                 counter.increment();
                 [counter.value, counter instanceof Counter, Counter.LIMIT]",
            )
            .unwrap();
        assert_eq!(
            result,
            JsValue::Array(vec![JsValue::from(2), JsValue::from(true), JsValue::from(100)])
        );
        assert_eq!(runtime.objects().len(), 1);
    }

    #[test]
    fn shared_objects_keep_their_identity() {
        let (_app, runtime) = demo();
        let id = runtime
            .eval("globalThis.counter = new tether.modules.Demo.Counter(5); counter")
            .unwrap();
        let JsValue::Shared(id) = id else {
            panic!("expected a shared object, got {id:?}");
        };
        assert!(runtime.objects().contains(id));
        assert_eq!(runtime.eval("counter.value").unwrap(), JsValue::from(5));
    }

    #[test]
    fn release_drops_the_native_object() {
        let (_app, runtime) = demo();
        let released = runtime
            .eval("const c = new tether.modules.Demo.Counter(1); c.release()")
            .unwrap();
        assert_eq!(released, JsValue::from(true));
        assert!(runtime.objects().is_empty());

        let code = runtime
            .eval("try { c.value } catch (e) { e.code }")
            .unwrap();
        assert_eq!(code, JsValue::from("ERR_ARGUMENT_CAST"));
    }

    #[test]
    fn collected_wrappers_release_their_objects() {
        let (_app, runtime) = demo();
        runtime
            .eval(
                "const { Counter } = tether.modules.Demo;
                 for (let i = 0; i < 1000; i++) { new Counter(i); }
                 globalThis.kept = new Counter(-1);
                 undefined",
            )
            .unwrap();
        runtime.collect_garbage().unwrap();
        assert_eq!(runtime.objects().len(), 1);
        assert_eq!(runtime.eval("kept.value").unwrap(), JsValue::from(-1));

        runtime.eval("kept = null; undefined").unwrap();
        runtime.collect_garbage().unwrap();
        assert!(runtime.objects().is_empty());
    }

    #[test]
    fn objects_outlive_all_but_their_last_wrapper() {
        let (_app, runtime) = demo();
        runtime
            .eval(
                "globalThis.first = new tether.modules.Demo.Counter(7);
                 globalThis.second = first.itself();
                 first = null;
                 undefined",
            )
            .unwrap();
        runtime.collect_garbage().unwrap();
        assert_eq!(runtime.objects().len(), 1);
        assert_eq!(runtime.eval("second.value").unwrap(), JsValue::from(7));

        runtime.eval("second = null; undefined").unwrap();
        runtime.collect_garbage().unwrap();
        assert!(runtime.objects().is_empty());
    }

    #[test]
    fn collecting_a_released_wrapper_is_harmless() {
        let (_app, runtime) = demo();
        runtime
            .eval(
                "const { Counter } = tether.modules.Demo;
                 globalThis.other = new Counter(2);
                 globalThis.c = new Counter(1);
                 c.release();
                 c = null;
                 undefined",
            )
            .unwrap();
        runtime.collect_garbage().unwrap();
        assert_eq!(runtime.objects().len(), 1);
        assert_eq!(runtime.eval("other.value").unwrap(), JsValue::from(2));
    }

    #[test]
    fn abandoned_evaluations_are_dropped() {
        let app = AppContext::new(BridgeSettings::default()).unwrap();
        let runtime = app.primary_runtime();
        let mut engine = QuickJsEngine::new().unwrap();
        engine
            .bind(EngineBindings {
                runtime: runtime.downgrade(),
                namespace: "tether".to_string(),
                modules: Vec::new(),
            })
            .unwrap();

        let (completion, _receiver) = Promise::channel();
        engine.eval_async("new Promise(() => {})", completion.clone());
        engine.run_pending_jobs();
        assert_eq!(engine.evaluations.borrow().len(), 1);

        completion.reject(BridgeError::context_lost("caller gave up"));
        engine.run_pending_jobs();
        assert!(engine.evaluations.borrow().is_empty());
    }

    #[test]
    fn eval_async_times_out_on_scripts_that_never_settle() {
        let (_app, runtime) = demo();
        let error = runtime
            .eval_async("new Promise(() => {})", Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Unexpected);
        assert_eq!(runtime.eval_async("2", WAIT).unwrap(), JsValue::from(2));
    }

    #[test]
    fn calling_a_class_without_new_throws() {
        let (_app, runtime) = demo();
        let error = runtime.eval("tether.modules.Demo.Counter(1)").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::JavaScript);
    }

    #[test]
    fn deallocation_drops_pending_evaluations() {
        let (_app, runtime) = demo();
        runtime.deallocate();
        let error = runtime.eval_async("1", WAIT).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ContextLost);
    }
}

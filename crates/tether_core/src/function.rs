//! Function dispatch
//!
//! A [`FunctionDescriptor`] is the native side of one script-callable member:
//! its declared argument types, how it runs, and its implementation.
//! Dispatch checks arity, converts every argument in order and only then
//! runs the implementation, so a call that fails validation never reaches
//! native code.

use crate::context::{CallContext, ModuleContext};
use crate::convert::{ArgType, Arguments, ConversionContext};
use crate::engine::FunctionExport;
use crate::error::{BridgeError, Result};
use crate::promise::{Promise, Settlement};
use crate::shared::SharedObjectRegistry;
use crate::value::JsValue;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use tracing::Instrument;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ValueBody = Arc<dyn Fn(&CallContext, Arguments) -> anyhow::Result<JsValue> + Send + Sync>;
type PromiseBody =
    Arc<dyn Fn(&CallContext, Arguments, Promise) -> anyhow::Result<()> + Send + Sync>;
type SuspendBody =
    Arc<dyn Fn(CallContext, Arguments) -> BoxFuture<anyhow::Result<JsValue>> + Send + Sync>;

/// How a call is executed and completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    /// Runs on the calling thread; completes before `call` returns.
    Immediate,
    /// Queued on the background executor.
    ScheduledAsync,
    /// Future polled on the background executor inside the module's scope.
    Suspending,
}

#[derive(Clone)]
enum Body {
    Value(ValueBody),
    Promise(PromiseBody),
    Suspend(SuspendBody),
}

/// Script-callable member of a module or class.
#[derive(Clone)]
pub struct FunctionDescriptor {
    name: String,
    owner: Option<String>,
    receiver: bool,
    arg_types: Vec<ArgType>,
    kind: DispatchKind,
    body: Body,
}

impl FunctionDescriptor {
    pub fn immediate<F>(name: &str, arg_types: Vec<ArgType>, body: F) -> Self
    where
        F: Fn(&CallContext, Arguments) -> anyhow::Result<JsValue> + Send + Sync + 'static,
    {
        Self::with_body(name, arg_types, DispatchKind::Immediate, Body::Value(Arc::new(body)))
    }

    pub fn scheduled<F>(name: &str, arg_types: Vec<ArgType>, body: F) -> Self
    where
        F: Fn(&CallContext, Arguments) -> anyhow::Result<JsValue> + Send + Sync + 'static,
    {
        Self::with_body(
            name,
            arg_types,
            DispatchKind::ScheduledAsync,
            Body::Value(Arc::new(body)),
        )
    }

    /// Scheduled call whose implementation settles the promise itself,
    /// possibly long after it returns.
    ///
    /// Returning an error rejects the promise unless it was already settled.
    pub fn scheduled_with_promise<F>(name: &str, arg_types: Vec<ArgType>, body: F) -> Self
    where
        F: Fn(&CallContext, Arguments, Promise) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_body(
            name,
            arg_types,
            DispatchKind::ScheduledAsync,
            Body::Promise(Arc::new(body)),
        )
    }

    pub fn suspending<F, Fut>(name: &str, arg_types: Vec<ArgType>, body: F) -> Self
    where
        F: Fn(CallContext, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JsValue>> + Send + 'static,
    {
        let body: SuspendBody = Arc::new(
            move |ctx: CallContext, args: Arguments| -> BoxFuture<anyhow::Result<JsValue>> {
                Box::pin(body(ctx, args))
            },
        );
        Self::with_body(name, arg_types, DispatchKind::Suspending, Body::Suspend(body))
    }

    fn with_body(name: &str, arg_types: Vec<ArgType>, kind: DispatchKind, body: Body) -> Self {
        Self {
            name: name.to_string(),
            owner: None,
            receiver: false,
            arg_types,
            kind,
            body,
        }
    }

    pub(crate) fn owned_by(mut self, class: &str) -> Self {
        self.owner = Some(class.to_string());
        self
    }

    /// Prepend the owning object as argument 0.
    pub(crate) fn with_receiver(mut self, class: &str) -> Self {
        self.arg_types.insert(0, ArgType::shared(class));
        self.receiver = true;
        self.owned_by(class)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Class.member` for class members, the bare name otherwise.
    pub fn qualified_name(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{owner}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn kind(&self) -> DispatchKind {
        self.kind
    }

    pub fn arg_types(&self) -> &[ArgType] {
        &self.arg_types
    }

    /// Exact number of arguments, receiver included.
    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }

    /// Whether the script side receives a promise rather than a value.
    pub fn returns_promise(&self) -> bool {
        self.kind != DispatchKind::Immediate
    }

    pub fn export(&self) -> FunctionExport {
        FunctionExport {
            name: self.name.clone(),
            kind: self.kind,
            arity: self.arity() - usize::from(self.receiver),
        }
    }

    /// Check arity and convert every argument, stopping at the first failure.
    pub fn prepare(&self, objects: &SharedObjectRegistry, raw: Vec<JsValue>) -> Result<Arguments> {
        if raw.len() != self.arg_types.len() {
            return Err(BridgeError::Arity {
                function: self.qualified_name(),
                expected: self.arg_types.len(),
                received: raw.len(),
            });
        }
        let ctx = ConversionContext::new(objects);
        let mut values = Vec::with_capacity(raw.len());
        for (index, (value, arg_type)) in raw.into_iter().zip(&self.arg_types).enumerate() {
            let converted =
                arg_type
                    .convert(value, &ctx)
                    .map_err(|source| BridgeError::ArgumentConversion {
                        function: self.qualified_name(),
                        index,
                        expected: arg_type.type_name(),
                        source,
                    })?;
            values.push(converted);
        }
        Ok(Arguments::new(values))
    }

    /// Validate, convert and run the call, completing `promise` according to
    /// this descriptor's [`DispatchKind`].
    pub fn call(&self, ctx: &ModuleContext, raw: Vec<JsValue>, promise: Promise) {
        let function = self.qualified_name();
        let promise = promise.for_call(ctx.module(), &function);
        let span = tracing::debug_span!(
            "call",
            module = ctx.module(),
            function = %function,
            kind = ?self.kind
        );
        let _entered = span.enter();

        if self.kind == DispatchKind::Suspending && !ctx.scope().is_active() {
            promise.reject(BridgeError::context_lost(format!(
                "module '{}' has been torn down",
                ctx.module()
            )));
            return;
        }

        let args = match self.prepare(ctx.runtime().objects(), raw) {
            Ok(args) => args,
            Err(error) => {
                tracing::debug!(%error, "call rejected before dispatch");
                promise.reject(error);
                return;
            }
        };
        let call_ctx = ctx.call_context(&function);

        match (&self.body, self.kind) {
            (Body::Value(body), DispatchKind::Immediate) => {
                promise.settle(run_value(body, &call_ctx, args));
            }
            (Body::Value(body), _) => {
                let body = body.clone();
                let settle = promise.clone();
                let span = span.clone();
                let spawned = ctx.executor().spawn_blocking(move || {
                    let _entered = span.enter();
                    settle.settle(run_value(&body, &call_ctx, args));
                });
                if let Err(error) = spawned {
                    promise.reject(error);
                }
            }
            (Body::Promise(body), _) => {
                let body = body.clone();
                let settle = promise.clone();
                let span = span.clone();
                let spawned = ctx.executor().spawn_blocking(move || {
                    let _entered = span.enter();
                    run_promise(&body, &call_ctx, args, settle);
                });
                if let Err(error) = spawned {
                    promise.reject(error);
                }
            }
            (Body::Suspend(body), _) => {
                suspend(ctx, body, call_ctx, args, promise, span.clone());
            }
        }
    }
}

fn run_value(body: &ValueBody, ctx: &CallContext, args: Arguments) -> Settlement {
    match panic::catch_unwind(AssertUnwindSafe(|| body(ctx, args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(BridgeError::from_implementation(
            ctx.module(),
            ctx.function(),
            error,
        )),
        Err(payload) => Err(BridgeError::from_panic(ctx.module(), ctx.function(), payload)),
    }
}

fn run_promise(body: &PromiseBody, ctx: &CallContext, args: Arguments, promise: Promise) {
    let error = match panic::catch_unwind(AssertUnwindSafe(|| body(ctx, args, promise.clone()))) {
        Ok(Ok(())) => return,
        Ok(Err(error)) => BridgeError::from_implementation(ctx.module(), ctx.function(), error),
        Err(payload) => BridgeError::from_panic(ctx.module(), ctx.function(), payload),
    };
    promise.settle(Err(error));
}

fn suspend(
    ctx: &ModuleContext,
    body: &SuspendBody,
    call_ctx: CallContext,
    args: Arguments,
    promise: Promise,
    span: tracing::Span,
) {
    let future = match panic::catch_unwind(AssertUnwindSafe(|| body(call_ctx.clone(), args))) {
        Ok(future) => future,
        Err(payload) => {
            promise.reject(BridgeError::from_panic(
                call_ctx.module(),
                call_ctx.function(),
                payload,
            ));
            return;
        }
    };

    let executor = ctx.executor();
    let task = match executor.spawn(future.instrument(span.clone())) {
        Ok(task) => task,
        Err(error) => {
            promise.reject(error);
            return;
        }
    };
    let abort = task.abort_handle();
    let scope = ctx.scope().clone();
    if !scope.track(abort.clone()) {
        abort.abort();
        return;
    }

    let settle = promise.clone();
    let watcher = async move {
        let outcome = match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(BridgeError::from_implementation(
                call_ctx.module(),
                call_ctx.function(),
                error,
            )),
            Err(join) => match join.try_into_panic() {
                Ok(payload) => Err(BridgeError::from_panic(
                    call_ctx.module(),
                    call_ctx.function(),
                    payload,
                )),
                Err(_) => {
                    tracing::debug!("suspending call cancelled");
                    return;
                }
            },
        };
        scope.settle_if_active(&settle, outcome);
    };
    if let Err(error) = executor.spawn(watcher.instrument(span)) {
        abort.abort();
        promise.reject(error);
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.qualified_name())
            .field("kind", &self.kind)
            .field("arg_types", &self.arg_types)
            .finish()
    }
}

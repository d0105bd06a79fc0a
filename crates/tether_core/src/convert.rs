//! Argument conversion
//!
//! Each declared argument type turns one raw [`JsValue`] into one
//! [`NativeValue`], or explains why it cannot. Argument count is data on the
//! function descriptor, not part of the type.

use crate::class::ClassDefinition;
use crate::error::ConversionError;
use crate::shared::{downcast_shared, ObjectId, SharedObject, SharedObjectRegistry};
use crate::value::JsValue;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lookups a converter may need while converting.
pub struct ConversionContext<'a> {
    objects: &'a SharedObjectRegistry,
}

impl<'a> ConversionContext<'a> {
    pub fn new(objects: &'a SharedObjectRegistry) -> Self {
        Self { objects }
    }

    pub fn objects(&self) -> &SharedObjectRegistry {
        self.objects
    }
}

/// Conversion for types the built-in [`ArgType`] variants do not cover.
pub trait ArgumentConverter: Send + Sync {
    fn type_name(&self) -> String;

    fn convert(
        &self,
        raw: JsValue,
        ctx: &ConversionContext<'_>,
    ) -> std::result::Result<NativeValue, ConversionError>;
}

/// Declared type of one function argument.
#[derive(Clone)]
pub enum ArgType {
    Any,
    Bool,
    Number,
    /// Finite number without a fractional part that fits in an `i64`.
    Integer,
    String,
    Array(Box<ArgType>),
    /// Plain object; fields stay raw.
    Record,
    /// Accepts `null`/`undefined` as [`NativeValue::Null`].
    Optional(Box<ArgType>),
    /// First alternative that converts wins.
    Either(Box<ArgType>, Box<ArgType>),
    /// Shared object identity, optionally restricted to one class.
    Shared(Option<String>),
    Custom(Arc<dyn ArgumentConverter>),
}

impl ArgType {
    pub fn array(element: ArgType) -> Self {
        ArgType::Array(Box::new(element))
    }

    pub fn optional(inner: ArgType) -> Self {
        ArgType::Optional(Box::new(inner))
    }

    pub fn either(first: ArgType, second: ArgType) -> Self {
        ArgType::Either(Box::new(first), Box::new(second))
    }

    pub fn shared(class: impl Into<String>) -> Self {
        ArgType::Shared(Some(class.into()))
    }

    pub fn custom(converter: impl ArgumentConverter + 'static) -> Self {
        ArgType::Custom(Arc::new(converter))
    }

    pub fn type_name(&self) -> String {
        match self {
            ArgType::Any => "any".to_string(),
            ArgType::Bool => "boolean".to_string(),
            ArgType::Number => "number".to_string(),
            ArgType::Integer => "integer".to_string(),
            ArgType::String => "string".to_string(),
            ArgType::Array(element) => format!("array<{}>", element.type_name()),
            ArgType::Record => "record".to_string(),
            ArgType::Optional(inner) => format!("{}?", inner.type_name()),
            ArgType::Either(a, b) => format!("{} | {}", a.type_name(), b.type_name()),
            ArgType::Shared(Some(class)) => format!("shared {class}"),
            ArgType::Shared(None) => "shared object".to_string(),
            ArgType::Custom(converter) => converter.type_name(),
        }
    }

    pub fn convert(
        &self,
        raw: JsValue,
        ctx: &ConversionContext<'_>,
    ) -> std::result::Result<NativeValue, ConversionError> {
        match (self, raw) {
            (ArgType::Any, raw) => Ok(NativeValue::Raw(raw)),
            (ArgType::Optional(_), raw) if raw.is_nullish() => Ok(NativeValue::Null),
            (ArgType::Optional(inner), raw) => inner.convert(raw, ctx),
            (ArgType::Either(first, second), raw) => first
                .convert(raw.clone(), ctx)
                .or_else(|_| second.convert(raw.clone(), ctx))
                .map_err(|_| self.mismatch(&raw)),
            (ArgType::Custom(converter), raw) => converter.convert(raw, ctx),
            (ArgType::Bool, JsValue::Bool(b)) => Ok(NativeValue::Bool(b)),
            (ArgType::Number, JsValue::Number(n)) => Ok(NativeValue::Number(n)),
            (ArgType::Integer, JsValue::Number(n)) => integer(n).map(NativeValue::Integer),
            (ArgType::String, JsValue::String(s)) => Ok(NativeValue::String(s)),
            (ArgType::Array(element), JsValue::Array(items)) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    element
                        .convert(item, ctx)
                        .map_err(|source| ConversionError::Element {
                            index,
                            source: Box::new(source),
                        })
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(NativeValue::Array),
            (ArgType::Record, JsValue::Object(fields)) => Ok(NativeValue::Record(fields)),
            (ArgType::Shared(class), JsValue::Shared(id)) => shared(id, class.as_deref(), ctx),
            (_, raw) => Err(self.mismatch(&raw)),
        }
    }

    fn mismatch(&self, raw: &JsValue) -> ConversionError {
        ConversionError::TypeMismatch {
            expected: self.type_name(),
            received: raw.kind_name(),
        }
    }
}

impl fmt::Debug for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name())
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name())
    }
}

fn integer(n: f64) -> std::result::Result<i64, ConversionError> {
    // 2^63 is exactly representable; anything at or beyond it overflows i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.is_finite() && n.fract() == 0.0 && n >= -LIMIT && n < LIMIT {
        Ok(n as i64)
    } else {
        Err(ConversionError::OutOfRange {
            value: n,
            expected: "integer",
        })
    }
}

fn shared(
    id: ObjectId,
    class: Option<&str>,
    ctx: &ConversionContext<'_>,
) -> std::result::Result<NativeValue, ConversionError> {
    let object = ctx
        .objects
        .resolve(id)
        .map_err(|_| ConversionError::ObjectNotFound { id })?;
    let definition = ctx
        .objects
        .class_of(id)
        .ok_or(ConversionError::ObjectNotFound { id })?;
    if let Some(expected) = class {
        if definition.name() != expected {
            return Err(ConversionError::WrongClass {
                id,
                expected: expected.to_string(),
                actual: definition.name().to_string(),
            });
        }
    }
    Ok(NativeValue::Shared(SharedRef {
        id,
        object,
        class: definition,
    }))
}

/// Resolved shared object argument.
#[derive(Clone)]
pub struct SharedRef {
    id: ObjectId,
    object: Arc<dyn SharedObject>,
    class: Arc<ClassDefinition>,
}

impl SharedRef {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn object(&self) -> &Arc<dyn SharedObject> {
        &self.object
    }

    pub fn class(&self) -> &ClassDefinition {
        &self.class
    }

    pub fn downcast<T: SharedObject>(&self) -> Option<Arc<T>> {
        downcast_shared::<T>(self.object.clone())
    }
}

impl fmt::Debug for SharedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRef")
            .field("id", &self.id)
            .field("class", &self.class.name())
            .finish()
    }
}

/// Strongly-typed argument handed to a native implementation.
#[derive(Debug, Clone)]
pub enum NativeValue {
    Null,
    Bool(bool),
    Number(f64),
    Integer(i64),
    String(String),
    Array(Vec<NativeValue>),
    Record(BTreeMap<String, JsValue>),
    Shared(SharedRef),
    Raw(JsValue),
}

impl NativeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, NativeValue::Null)
    }
}

/// Converted arguments, in declaration order.
///
/// Accessors fail only when an implementation asks for a type it did not
/// declare, which surfaces as an unexpected error.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: Vec<NativeValue>,
}

impl Arguments {
    pub fn new(values: Vec<NativeValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NativeValue> {
        self.values.get(index)
    }

    pub fn into_vec(self) -> Vec<NativeValue> {
        self.values
    }

    fn at(&self, index: usize) -> Result<&NativeValue> {
        self.values
            .get(index)
            .ok_or_else(|| anyhow!("argument {index} was not declared"))
    }

    /// `None` when an optional argument was passed as null or undefined.
    pub fn optional(&self, index: usize) -> Result<Option<&NativeValue>> {
        self.at(index).map(|value| (!value.is_null()).then_some(value))
    }

    pub fn bool(&self, index: usize) -> Result<bool> {
        match self.at(index)? {
            NativeValue::Bool(b) => Ok(*b),
            other => Err(anyhow!("argument {index} is not a boolean: {other:?}")),
        }
    }

    pub fn number(&self, index: usize) -> Result<f64> {
        match self.at(index)? {
            NativeValue::Number(n) => Ok(*n),
            NativeValue::Integer(i) => Ok(*i as f64),
            other => Err(anyhow!("argument {index} is not a number: {other:?}")),
        }
    }

    pub fn integer(&self, index: usize) -> Result<i64> {
        match self.at(index)? {
            NativeValue::Integer(i) => Ok(*i),
            other => Err(anyhow!("argument {index} is not an integer: {other:?}")),
        }
    }

    pub fn string(&self, index: usize) -> Result<&str> {
        match self.at(index)? {
            NativeValue::String(s) => Ok(s),
            other => Err(anyhow!("argument {index} is not a string: {other:?}")),
        }
    }

    pub fn array(&self, index: usize) -> Result<&[NativeValue]> {
        match self.at(index)? {
            NativeValue::Array(items) => Ok(items),
            other => Err(anyhow!("argument {index} is not an array: {other:?}")),
        }
    }

    pub fn record(&self, index: usize) -> Result<&BTreeMap<String, JsValue>> {
        match self.at(index)? {
            NativeValue::Record(fields) => Ok(fields),
            other => Err(anyhow!("argument {index} is not a record: {other:?}")),
        }
    }

    pub fn raw(&self, index: usize) -> Result<&JsValue> {
        match self.at(index)? {
            NativeValue::Raw(value) => Ok(value),
            other => Err(anyhow!("argument {index} was converted, not raw: {other:?}")),
        }
    }

    pub fn shared(&self, index: usize) -> Result<&SharedRef> {
        match self.at(index)? {
            NativeValue::Shared(shared) => Ok(shared),
            other => Err(anyhow!("argument {index} is not a shared object: {other:?}")),
        }
    }

    /// Shared object argument downcast to its concrete type.
    pub fn object<T: SharedObject>(&self, index: usize) -> Result<Arc<T>> {
        let shared = self.shared(index)?;
        shared.downcast::<T>().ok_or_else(|| {
            anyhow!(
                "argument {index} ({}) has an unexpected native type",
                shared.class().name()
            )
        })
    }
}

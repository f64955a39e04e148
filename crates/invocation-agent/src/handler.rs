//! Adapting user handlers to a uniform invocation signature.
//!
//! Any async function of zero to two parameters can be decorated. A handler
//! that wants the [`InvocationContext`] takes it as its first parameter; the
//! remaining parameter receives the decoded payload. Its shape is inspected
//! once, when it is adapted, and rejected with a [`HandlerShapeError`] if it
//! cannot be driven:
//!
//! | Parameters             | Accepted                                   |
//! |------------------------|--------------------------------------------|
//! | `()`                   | yes                                        |
//! | `(ctx)` or `(payload)` | yes                                        |
//! | `(ctx, payload)`       | yes                                        |
//! | `(payload, payload)`   | no, the first must be the context          |
//! | three or more          | no                                         |
//!
//! The future may resolve to `()`, `Result<T, E>`, or a plain value such as
//! `String` or `serde_json::Value`. Tuples stand in for multiple return
//! values and are rejected.

use crate::context::InvocationContext;
use crate::error::{BoxError, HandlerError, HandlerShapeError};
use crate::panic::short_type_name;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId, type_name};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type InvokeFn<R> =
    dyn Fn(InvocationContext, Arc<Value>) -> BoxFuture<Result<R, HandlerError>> + Send + Sync;

/// What kind of value was offered as a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    /// No handler at all.
    Nil,
    /// Something callable.
    Func,
    /// A value of the named kind that cannot be called.
    Other(String),
}

/// A handler parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Context,
    Payload { type_name: String },
}

impl Param {
    fn type_name(&self) -> &str {
        match self {
            Param::Context => "InvocationContext",
            Param::Payload { type_name } => type_name,
        }
    }
}

/// A value produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Return {
    Value { type_name: String },
    Error { type_name: String },
}

/// Introspected signature of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerShape {
    pub kind: HandlerKind,
    pub params: Vec<Param>,
    pub returns: Vec<Return>,
}

impl HandlerShape {
    /// Shape of a callable with the given parameters and return values.
    pub fn func(params: Vec<Param>, returns: Vec<Return>) -> Self {
        Self {
            kind: HandlerKind::Func,
            params,
            returns,
        }
    }

    pub fn nil() -> Self {
        Self {
            kind: HandlerKind::Nil,
            params: Vec::new(),
            returns: Vec::new(),
        }
    }

    /// Shape of a non-callable value of kind `kind`.
    pub fn other(kind: impl Into<String>) -> Self {
        Self {
            kind: HandlerKind::Other(kind.into()),
            params: Vec::new(),
            returns: Vec::new(),
        }
    }

    /// Whether the handler wants the invocation context.
    pub fn takes_context(&self) -> bool {
        self.params.first() == Some(&Param::Context)
    }

    /// Checks the shape against the rules for adaptable handlers.
    pub fn validate(&self) -> Result<(), HandlerShapeError> {
        match &self.kind {
            HandlerKind::Nil => return Err(HandlerShapeError::Nil),
            HandlerKind::Other(kind) => {
                return Err(HandlerShapeError::NotFunc { kind: kind.clone() });
            }
            HandlerKind::Func => {}
        }

        if self.params.len() > 2 {
            return Err(HandlerShapeError::TooManyArguments {
                count: self.params.len(),
            });
        }

        if self.params.len() == 2 && !self.takes_context() {
            return Err(HandlerShapeError::FirstArgumentNotContext {
                got: self.params[0].type_name().to_string(),
            });
        }

        if self.returns.len() > 2 {
            return Err(HandlerShapeError::TooManyReturnValues);
        }

        if self.returns.len() == 2 && !matches!(self.returns[1], Return::Error { .. }) {
            return Err(HandlerShapeError::SecondReturnNotError);
        }

        Ok(())
    }
}

/// The output of a handler future.
pub trait HandlerOutput: Send + 'static {
    /// The response passed back to the platform.
    type Response: Send + 'static;

    fn returns() -> Vec<Return>;

    fn into_result(self) -> Result<Self::Response, HandlerError>;
}

fn value_return<T: ?Sized>() -> Return {
    Return::Value {
        type_name: short_type_name(type_name::<T>()),
    }
}

impl HandlerOutput for () {
    type Response = ();

    fn returns() -> Vec<Return> {
        Vec::new()
    }

    fn into_result(self) -> Result<(), HandlerError> {
        Ok(())
    }
}

impl<T, E> HandlerOutput for Result<T, E>
where
    T: Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    type Response = T;

    fn returns() -> Vec<Return> {
        let error = Return::Error {
            type_name: short_type_name(type_name::<E>()),
        };
        if TypeId::of::<T>() == TypeId::of::<()>() {
            vec![error]
        } else {
            vec![value_return::<T>(), error]
        }
    }

    fn into_result(self) -> Result<T, HandlerError> {
        self.map_err(HandlerError::new)
    }
}

macro_rules! plain_output {
    ($($ty:ty),* $(,)?) => {
        $(
            impl HandlerOutput for $ty {
                type Response = $ty;

                fn returns() -> Vec<Return> {
                    vec![value_return::<$ty>()]
                }

                fn into_result(self) -> Result<$ty, HandlerError> {
                    Ok(self)
                }
            }
        )*
    };
}

plain_output!(Value, String, bool, i32, i64, u32, u64, f64);

impl<A, B> HandlerOutput for (A, B)
where
    A: Send + 'static,
    B: Send + 'static,
{
    type Response = (A, B);

    fn returns() -> Vec<Return> {
        vec![value_return::<A>(), value_return::<B>()]
    }

    fn into_result(self) -> Result<(A, B), HandlerError> {
        Ok(self)
    }
}

impl<A, B, C> HandlerOutput for (A, B, C)
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    type Response = (A, B, C);

    fn returns() -> Vec<Return> {
        vec![value_return::<A>(), value_return::<B>(), value_return::<C>()]
    }

    fn into_result(self) -> Result<(A, B, C), HandlerError> {
        Ok(self)
    }
}

/// A handler parameter: either the invocation context or a payload type.
pub trait HandlerParam: DeserializeOwned + Send + 'static {}

impl<T: DeserializeOwned + Send + 'static> HandlerParam for T {}

fn param<T: HandlerParam>() -> Param {
    if TypeId::of::<T>() == TypeId::of::<InvocationContext>() {
        Param::Context
    } else {
        Param::Payload {
            type_name: short_type_name(type_name::<T>()),
        }
    }
}

fn extract<T: HandlerParam>(ctx: &InvocationContext, payload: &Value) -> Result<T, HandlerError> {
    if TypeId::of::<T>() == TypeId::of::<InvocationContext>() {
        let boxed: Box<dyn Any> = Box::new(ctx.clone());
        return boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| HandlerError::msg("invocation context type mismatch"));
    }
    T::deserialize(payload).map_err(HandlerError::decode)
}

/// Something that can be adapted into an invocation handler.
///
/// Implemented for async closures and functions of up to three parameters
/// (three so the arity error can be reported), for `Option` of any handler,
/// and for [`RawHandler`]. `M` is an inference marker and can be ignored.
pub trait IntoHandler<M>: Sized + Send + Sync + 'static {
    type Response: Send + 'static;

    fn shape(&self) -> HandlerShape;

    /// Builds the adapter without checking the shape.
    fn into_adapter(self, shape: HandlerShape) -> Result<Adapter<Self::Response>, HandlerShapeError>;
}

impl<F, Fut, O> IntoHandler<(O,)> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput,
{
    type Response = O::Response;

    fn shape(&self) -> HandlerShape {
        HandlerShape::func(Vec::new(), O::returns())
    }

    fn into_adapter(self, shape: HandlerShape) -> Result<Adapter<O::Response>, HandlerShapeError> {
        let f = Arc::new(self);
        Ok(Adapter::new_unchecked(shape, move |_ctx, _payload| {
            let f = Arc::clone(&f);
            Box::pin(async move { (*f)().await.into_result() })
        }))
    }
}

impl<F, Fut, O, A> IntoHandler<(O, A)> for F
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput,
    A: HandlerParam,
{
    type Response = O::Response;

    fn shape(&self) -> HandlerShape {
        HandlerShape::func(vec![param::<A>()], O::returns())
    }

    fn into_adapter(self, shape: HandlerShape) -> Result<Adapter<O::Response>, HandlerShapeError> {
        let f = Arc::new(self);
        Ok(Adapter::new_unchecked(shape, move |ctx, payload| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let a = extract::<A>(&ctx, &payload)?;
                (*f)(a).await.into_result()
            })
        }))
    }
}

impl<F, Fut, O, A, B> IntoHandler<(O, A, B)> for F
where
    F: Fn(A, B) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput,
    A: HandlerParam,
    B: HandlerParam,
{
    type Response = O::Response;

    fn shape(&self) -> HandlerShape {
        HandlerShape::func(vec![param::<A>(), param::<B>()], O::returns())
    }

    fn into_adapter(self, shape: HandlerShape) -> Result<Adapter<O::Response>, HandlerShapeError> {
        let f = Arc::new(self);
        Ok(Adapter::new_unchecked(shape, move |ctx, payload| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let a = extract::<A>(&ctx, &payload)?;
                let b = extract::<B>(&ctx, &payload)?;
                (*f)(a, b).await.into_result()
            })
        }))
    }
}

impl<F, Fut, O, A, B, C> IntoHandler<(O, A, B, C)> for F
where
    F: Fn(A, B, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: HandlerOutput,
    A: HandlerParam,
    B: HandlerParam,
    C: HandlerParam,
{
    type Response = O::Response;

    fn shape(&self) -> HandlerShape {
        HandlerShape::func(vec![param::<A>(), param::<B>(), param::<C>()], O::returns())
    }

    fn into_adapter(self, shape: HandlerShape) -> Result<Adapter<O::Response>, HandlerShapeError> {
        Err(HandlerShapeError::TooManyArguments {
            count: shape.params.len(),
        })
    }
}

/// Inference marker for optional handlers.
pub struct Nullable<M>(PhantomData<fn() -> M>);

impl<H, M> IntoHandler<Nullable<M>> for Option<H>
where
    H: IntoHandler<M>,
{
    type Response = H::Response;

    fn shape(&self) -> HandlerShape {
        match self {
            Some(handler) => handler.shape(),
            None => HandlerShape::nil(),
        }
    }

    fn into_adapter(self, shape: HandlerShape) -> Result<Adapter<H::Response>, HandlerShapeError> {
        match self {
            Some(handler) => handler.into_adapter(shape),
            None => Err(HandlerShapeError::Nil),
        }
    }
}

/// A handler whose shape is declared explicitly rather than inferred.
///
/// Used for handlers resolved at runtime, for example from a registry,
/// where the invoked function is only known as a boxed callable.
pub struct RawHandler<R> {
    shape: HandlerShape,
    call: Arc<InvokeFn<R>>,
}

impl<R: Send + 'static> RawHandler<R> {
    pub fn new<F>(shape: HandlerShape, call: F) -> Self
    where
        F: Fn(InvocationContext, Arc<Value>) -> BoxFuture<Result<R, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            shape,
            call: Arc::new(call),
        }
    }
}

/// Inference marker for [`RawHandler`].
pub struct Raw;

impl<R: Send + 'static> IntoHandler<Raw> for RawHandler<R> {
    type Response = R;

    fn shape(&self) -> HandlerShape {
        self.shape.clone()
    }

    fn into_adapter(self, shape: HandlerShape) -> Result<Adapter<R>, HandlerShapeError> {
        Ok(Adapter { shape, call: self.call })
    }
}

/// A validated handler with a uniform `(context, payload)` signature.
pub struct Adapter<R> {
    shape: HandlerShape,
    call: Arc<InvokeFn<R>>,
}

impl<R> Clone for Adapter<R> {
    fn clone(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            call: Arc::clone(&self.call),
        }
    }
}

impl<R: Send + 'static> Adapter<R> {
    /// Inspects and validates `handler`, then adapts it.
    pub fn new<H, M>(handler: H) -> Result<Self, HandlerShapeError>
    where
        H: IntoHandler<M, Response = R>,
    {
        let shape = handler.shape();
        shape.validate()?;
        handler.into_adapter(shape)
    }

    fn new_unchecked<F>(shape: HandlerShape, call: F) -> Self
    where
        F: Fn(InvocationContext, Arc<Value>) -> BoxFuture<Result<R, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            shape,
            call: Arc::new(call),
        }
    }

    pub fn shape(&self) -> &HandlerShape {
        &self.shape
    }

    /// Decodes the payload as needed and calls the handler.
    ///
    /// A payload that does not decode into the handler's input type is
    /// returned as an error without calling the handler.
    pub fn invoke(
        &self,
        ctx: InvocationContext,
        payload: Arc<Value>,
    ) -> BoxFuture<Result<R, HandlerError>> {
        (self.call)(ctx, payload)
    }
}

impl<R> std::fmt::Debug for Adapter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

//! Typed Slot Views
//!
//! A `CtxView<S>` is a zero-cost permission handle over a `Context`. The
//! spec type `S` declares, at the type level, which slot tags a step may
//! read (`ReadsSlot<T>`) and which it may write (`WritesSlot<T>`); access
//! outside those sets does not compile. `WritesSlot` implies read access,
//! so the readable set is always R ∪ W.
//!
//! The same spec reports its read/write sets at runtime (`ViewSpec`) so
//! the executor can record per-step data dependencies.

use std::marker::PhantomData;

use zerver_types::Error;

use crate::context::Context;
use crate::slots::SlotValue;

/// Conversion between a tag's value type and the stored `SlotValue`.
pub trait SlotCodec: Sized {
    fn into_slot(self) -> SlotValue;
    fn from_slot(value: &SlotValue) -> Option<Self>;
}

impl SlotCodec for i64 {
    fn into_slot(self) -> SlotValue {
        SlotValue::Int(self)
    }
    fn from_slot(value: &SlotValue) -> Option<Self> {
        value.as_int()
    }
}

impl SlotCodec for f64 {
    fn into_slot(self) -> SlotValue {
        SlotValue::Float(self)
    }
    fn from_slot(value: &SlotValue) -> Option<Self> {
        value.as_float()
    }
}

impl SlotCodec for bool {
    fn into_slot(self) -> SlotValue {
        SlotValue::Bool(self)
    }
    fn from_slot(value: &SlotValue) -> Option<Self> {
        value.as_bool()
    }
}

impl SlotCodec for String {
    fn into_slot(self) -> SlotValue {
        SlotValue::Text(self)
    }
    fn from_slot(value: &SlotValue) -> Option<Self> {
        value.as_str().map(|s| s.to_string())
    }
}

impl SlotCodec for Vec<u8> {
    fn into_slot(self) -> SlotValue {
        SlotValue::Bytes(self)
    }
    fn from_slot(value: &SlotValue) -> Option<Self> {
        value.as_bytes().map(|b| b.to_vec())
    }
}

impl SlotCodec for serde_json::Value {
    fn into_slot(self) -> SlotValue {
        SlotValue::Json(self)
    }
    fn from_slot(value: &SlotValue) -> Option<Self> {
        value.as_json().cloned()
    }
}

/// A compile-time slot tag: a zero-sized marker naming one slot and fixing
/// its value type.
pub trait SlotTag {
    type Value: SlotCodec;
    const ID: u32;
    const NAME: &'static str;
}

/// Spec `S` may read slot `T`.
pub trait ReadsSlot<T: SlotTag> {}

/// Spec `S` may write slot `T`. Writing implies reading.
pub trait WritesSlot<T: SlotTag>: ReadsSlot<T> {}

/// Runtime reflection of a view spec's read/write sets.
pub trait ViewSpec {
    fn reads() -> &'static [u32];
    fn writes() -> &'static [u32];
}

/// Permission-checked handle over a `Context`.
pub struct CtxView<'c, S: ViewSpec> {
    ctx: &'c mut Context,
    _spec: PhantomData<S>,
}

impl<'c, S: ViewSpec> CtxView<'c, S> {
    pub fn new(ctx: &'c mut Context) -> Self {
        Self {
            ctx,
            _spec: PhantomData,
        }
    }

    /// Read a slot the spec grants access to; errors when it is absent or
    /// holds an incompatible value.
    pub fn require<T: SlotTag>(&self) -> Result<T::Value, Error>
    where
        S: ReadsSlot<T>,
    {
        self.ctx
            .slot_get(T::ID)
            .and_then(T::Value::from_slot)
            .ok_or_else(|| Error::internal("slot", T::NAME))
    }

    /// Read a slot the spec grants access to; `None` when absent.
    pub fn optional<T: SlotTag>(&self) -> Option<T::Value>
    where
        S: ReadsSlot<T>,
    {
        self.ctx.slot_get(T::ID).and_then(T::Value::from_slot)
    }

    /// Write a slot the spec declares writable.
    pub fn put<T: SlotTag>(&mut self, value: T::Value)
    where
        S: WritesSlot<T>,
    {
        self.ctx.slot_put(T::ID, value.into_slot());
    }

    // Read-only passthroughs to the underlying context. Request metadata
    // is not permission-gated; only slots are.

    pub fn param(&self, name: &str) -> Option<&str> {
        self.ctx.param(name)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.ctx.query(name)
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.ctx.header(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.ctx.header_str(name)
    }

    pub fn request_id(&self) -> &str {
        self.ctx.request_id()
    }

    pub fn user(&self) -> Option<&str> {
        self.ctx.user()
    }
}

/// Trampoline: run a view-typed function against a raw context. The
/// executor uses this to lift view-typed steps into the context-typed
/// call shape.
pub fn with_view<S: ViewSpec, R>(
    ctx: &mut Context,
    f: impl FnOnce(&mut CtxView<'_, S>) -> R,
) -> R {
    let mut view = CtxView::new(ctx);
    f(&mut view)
}

//! # Boundary Adapter
//!
//! Typed request functions, and the trampolines the backend calls to deliver
//! their results.
//!
//! ## Call lifecycle
//!
//! `Pending` (callback registered) -> `AwaitingNative` (entry point invoked) ->
//! `Fired` (trampoline removed the token, then ran the callback) or `Released`
//! (teardown removed the token). Both end states are final: the token is gone
//! from the registry and any later trampoline for it is a protocol violation.
//!
//! ## Invariants
//!
//! - **Remove Before Run**: a trampoline takes the token out of the registry
//!   before any caller code runs, so a callback that issues new requests (even
//!   on the backend's thread) never contends with its own entry.
//! - **Copy Before Return**: native argument buffers are copied into owned values
//!   before the callback runs; nothing native outlives the trampoline call.
//! - **No Unwinding**: a panic inside the trampoline, whether from running or
//!   dropping a callback, is caught before it reaches the backend.

use std::ffi::c_char;
use std::ffi::c_void;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::debug;
use tracing::error;

use crate::backend::Backend;
use crate::registry::Callback;
use crate::registry::ProtocolViolation;
use crate::registry::Registry;
use crate::registry::RegistryStats;
use crate::registry::ResultFn;
use crate::registry::Shape;
use crate::registry::Token;
use crate::wire::ApplicationDescriptor;
use crate::wire::FfiAppInfo;
use crate::wire::FfiResult;
use crate::wire::OperationResult;
use crate::wire::copy_text;

/// An owned value a trampoline delivers alongside the `OperationResult`.
///
/// Ties each argument type to its `Callback` variant, so a trampoline only ever
/// consumes entries registered for its own shape.
pub trait NativeArg: Sized + Send + 'static {
    const SHAPE: Shape;

    fn into_callback(f: ResultFn<Self>) -> Callback;

    fn from_callback(callback: Callback) -> Option<ResultFn<Self>>;
}

impl NativeArg for () {
    const SHAPE: Shape = Shape::Unit;

    fn into_callback(f: ResultFn<Self>) -> Callback {
        Callback::Unit(f)
    }

    fn from_callback(callback: Callback) -> Option<ResultFn<Self>> {
        match callback {
            Callback::Unit(f) => Some(f),
            _ => None,
        }
    }
}

impl NativeArg for i32 {
    const SHAPE: Shape = Shape::Int;

    fn into_callback(f: ResultFn<Self>) -> Callback {
        Callback::Int(f)
    }

    fn from_callback(callback: Callback) -> Option<ResultFn<Self>> {
        match callback {
            Callback::Int(f) => Some(f),
            _ => None,
        }
    }
}

impl NativeArg for String {
    const SHAPE: Shape = Shape::Text;

    fn into_callback(f: ResultFn<Self>) -> Callback {
        Callback::Text(f)
    }

    fn from_callback(callback: Callback) -> Option<ResultFn<Self>> {
        match callback {
            Callback::Text(f) => Some(f),
            _ => None,
        }
    }
}

/// Shared body of every trampoline. Nothing inside it may unwind into the
/// backend's frame: caller closures can panic when run and when dropped, and
/// the last registry handle can be released here.
///
/// # Safety
///
/// `result` must be null or point to an `FfiResult` (and message) that stays
/// valid for the duration of this call.
unsafe fn deliver<A: NativeArg>(ctx: *mut c_void, result: *const FfiResult, arg: impl FnOnce() -> Option<A>) {
    let token = Token::from_ctx(ctx);

    // SAFETY: forwarded from the caller.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { dispatch(token, result, arg) }));
    if outcome.is_err() {
        error!(%token, "panic contained at the boundary");
    }
}

/// # Safety
///
/// Same contract as [`deliver`].
unsafe fn dispatch<A: NativeArg>(token: Token, result: *const FfiResult, arg: impl FnOnce() -> Option<A>) {
    let registry = match Registry::lookup(token) {
        Ok(registry) => registry,
        Err(violation) => {
            error!(%token, error = %violation, "protocol violation; dropping invocation");
            return;
        }
    };

    let callback = match registry.resolve_shaped(token, A::SHAPE) {
        Ok(callback) => callback,
        Err(violation) => {
            registry.note_violation(&violation);
            return;
        }
    };

    // resolve_shaped only hands out entries of A::SHAPE.
    let Some(f) = A::from_callback(callback) else {
        return;
    };

    if result.is_null() {
        registry.note_discarded(&ProtocolViolation::NullResult(token));
        return;
    }

    // SAFETY: non-null, and valid for this call per the caller's contract.
    let result = unsafe { OperationResult::decode(&*result) };

    let Some(arg) = arg() else {
        registry.note_discarded(&ProtocolViolation::NullArgument(token));
        return;
    };

    registry.note_fired(token);
    debug!(%token, code = result.code, "delivering result");
    drop(registry);

    f(result, arg);
}

/// Trampoline for `cb_t`.
///
/// # Safety
///
/// `result` must be null or point to an `FfiResult` that stays valid for the
/// duration of this call.
pub unsafe extern "C" fn on_unit(ctx: *mut c_void, result: *const FfiResult) {
    unsafe { deliver::<()>(ctx, result, || Some(())) }
}

/// Trampoline for `cb_i32_t`.
///
/// # Safety
///
/// Same contract as [`on_unit`].
pub unsafe extern "C" fn on_i32(ctx: *mut c_void, result: *const FfiResult, arg: i32) {
    unsafe { deliver::<i32>(ctx, result, || Some(arg)) }
}

/// Trampoline for `cb_string_t`. The text is copied before the callback runs.
///
/// # Safety
///
/// Same contract as [`on_unit`]; `arg` must additionally be null or point to a
/// NUL-terminated string that stays valid for the duration of this call.
pub unsafe extern "C" fn on_string(ctx: *mut c_void, result: *const FfiResult, arg: *const c_char) {
    unsafe { deliver::<String>(ctx, result, || copy_text(arg)) }
}

/// Outcome of tearing down a `Bindings` with calls still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    /// Tokens released without firing. Their callbacks will never run.
    pub released: usize,
}

/// Caller-facing request functions over a backend.
///
/// Each `Bindings` owns one registry. Requests return as soon as the backend
/// accepts them; results arrive on the backend's threads through the callbacks.
pub struct Bindings<B: Backend> {
    backend: B,
    registry: Arc<Registry>,
}

impl<B: Backend> Bindings<B> {
    pub fn new(backend: B) -> crate::Result<Self> {
        let registry = Registry::new()?;
        Ok(Self { backend, registry })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Registers the application. `callback` receives the backend's verdict.
    pub fn register_app<F>(&self, descriptor: &ApplicationDescriptor, callback: F) -> Token
    where
        F: FnOnce(OperationResult) + Send + 'static,
    {
        let callback: ResultFn<()> = Box::new(move |result, ()| callback(result));
        self.issue(descriptor, callback, |backend, app, ctx| backend.register_app(app, ctx, on_unit))
    }

    /// Looks up the application id. `callback` receives the verdict and the id.
    pub fn get_app_id<F>(&self, descriptor: &ApplicationDescriptor, callback: F) -> Token
    where
        F: FnOnce(OperationResult, i32) + Send + 'static,
    {
        let callback: ResultFn<i32> = Box::new(callback);
        self.issue(descriptor, callback, |backend, app, ctx| backend.get_app_id(app, ctx, on_i32))
    }

    /// Looks up the application name. `callback` receives the verdict and an
    /// owned copy of the name.
    pub fn get_app_name<F>(&self, descriptor: &ApplicationDescriptor, callback: F) -> Token
    where
        F: FnOnce(OperationResult, String) + Send + 'static,
    {
        let callback: ResultFn<String> = Box::new(callback);
        self.issue(descriptor, callback, |backend, app, ctx| backend.get_app_name(app, ctx, on_string))
    }

    /// Registers the callback, then hands the encoded descriptor and token to
    /// the backend. The encoding lives until the entry point returns.
    fn issue<A: NativeArg>(
        &self,
        descriptor: &ApplicationDescriptor,
        callback: ResultFn<A>,
        enter: impl FnOnce(&B, &FfiAppInfo, *mut c_void),
    ) -> Token {
        let encoded = descriptor.encode();
        let token = self.registry.register(A::into_callback(callback));
        enter(&self.backend, encoded.as_ffi(), token.into_ctx());
        token
    }

    /// Drops a single outstanding call. Returns whether it was still pending.
    pub fn release(&self, token: Token) -> bool {
        self.registry.release(token)
    }

    /// Releases every outstanding call.
    pub fn shutdown(&self) -> Teardown {
        Teardown { released: self.registry.release_all() }
    }
}

impl<B: Backend> std::fmt::Debug for Bindings<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings").field("registry", &self.registry).finish_non_exhaustive()
    }
}

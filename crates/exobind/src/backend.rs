//! # Backend Abstraction
//!
//! The three entry points of the native backend, as an object-safe trait.
//!
//! ## Philosophy
//!
//! - **ABI-Shaped**: Methods take exactly what the C entry points take: a borrowed
//!   `AppInfo`, the opaque `ctx`, and a typed callback. The adapter does not care
//!   whether the other side is the linked library or an in-process stand-in.
//! - **Fire and Forget**: Entry points return as soon as the work is scheduled.
//!   The result arrives later through the callback.

use std::ffi::c_char;
use std::ffi::c_void;

use crate::wire::FfiAppInfo;
use crate::wire::FfiResult;

/// `typedef void(*cb_t)(void*, const FfiResult*);`
pub type CbUnit = unsafe extern "C" fn(ctx: *mut c_void, result: *const FfiResult);

/// `typedef void(*cb_i32_t)(void*, const FfiResult*, int32_t);`
pub type CbI32 = unsafe extern "C" fn(ctx: *mut c_void, result: *const FfiResult, arg: i32);

/// `typedef void(*cb_string_t)(void*, const FfiResult*, const char*);`
pub type CbString = unsafe extern "C" fn(ctx: *mut c_void, result: *const FfiResult, arg: *const c_char);

/// The native backend's entry points.
///
/// # Invariants
/// - `app` (including its name pointer) is only valid until the method returns.
///   Implementations copy whatever they need before returning.
/// - The callback must be invoked exactly once with the same `ctx`, on any thread.
/// - Pointers passed to the callback only need to stay valid for that invocation.
pub trait Backend: Send + Sync + 'static {
    fn register_app(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbUnit);

    fn get_app_id(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbI32);

    fn get_app_name(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbString);
}

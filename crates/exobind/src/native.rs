//! Entry points of the linked `libbackend`.

use std::ffi::c_void;

use crate::backend::Backend;
use crate::backend::CbI32;
use crate::backend::CbString;
use crate::backend::CbUnit;
use crate::wire::FfiAppInfo;

mod ffi {
    use super::*;

    #[link(name = "backend")]
    unsafe extern "C" {
        pub fn register_app(app_info: *const FfiAppInfo, ctx: *mut c_void, o_cb: CbUnit);
        pub fn get_app_id(app_info: *const FfiAppInfo, ctx: *mut c_void, o_cb: CbI32);
        pub fn get_app_name(app_info: *const FfiAppInfo, ctx: *mut c_void, o_cb: CbString);
    }
}

/// The real backend, reached through the C ABI.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

// SAFETY (all three): `app` is a live reference for the whole call and the backend
// copies what it keeps before returning. Each callback has the exact C signature
// the header declares for that entry point.
impl Backend for NativeBackend {
    fn register_app(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbUnit) {
        unsafe { ffi::register_app(app, ctx, cb) }
    }

    fn get_app_id(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbI32) {
        unsafe { ffi::get_app_id(app, ctx, cb) }
    }

    fn get_app_name(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbString) {
        unsafe { ffi::get_app_name(app, ctx, cb) }
    }
}

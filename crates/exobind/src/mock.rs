//! In-process stand-in for the native backend.
//!
//! Behaves like the reference C++ backend: the descriptor is copied before the
//! entry point returns, each call completes on its own detached thread, and
//! every buffer handed to a trampoline is freed as soon as the trampoline
//! returns. Text buffers are zeroed before they are freed, so a callback that
//! kept a pointer instead of a copy would see garbage.

use std::ffi::c_char;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::backend::Backend;
use crate::backend::CbI32;
use crate::backend::CbString;
use crate::backend::CbUnit;
use crate::wire::ApplicationDescriptor;
use crate::wire::FfiAppInfo;
use crate::wire::OperationResult;

/// Error code reported when a descriptor arrives without a name.
pub const INVALID_APP_INFO: i32 = -2;

/// What the mock reports for every call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// `{ 0, "OK" }`, with the descriptor's id or name as the argument.
    Success,
    /// A backend-defined failure, with a zero id or empty name as the argument.
    Failure { code: i32, message: String },
}

impl Outcome {
    fn result(&self) -> OperationResult {
        match self {
            Self::Success => OperationResult::ok(),
            Self::Failure { code, message } => OperationResult::failure(*code, message.clone()),
        }
    }
}

/// A completion waiting to be delivered. `ctx` is stored as an address so the
/// completion can move to another thread.
enum Completion {
    Unit { ctx: usize, cb: CbUnit },
    Int { ctx: usize, cb: CbI32, id: i32 },
    Text { ctx: usize, cb: CbString, name: String },
}

/// Fluent configuration for a `MockBackend`.
#[derive(Clone, Debug)]
pub struct MockBuilder {
    min_latency: Duration,
    max_latency: Duration,
    outcome: Outcome,
    hold: bool,
}

impl MockBuilder {
    pub fn new() -> Self {
        Self {
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            outcome: Outcome::Success,
            hold: false,
        }
    }

    /// Each completion waits a random time in `min..=max` before firing.
    pub fn latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max.max(min);
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Keep completions queued until `fire_held` instead of firing them.
    pub fn hold(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }

    pub fn build(self) -> MockBackend {
        MockBackend {
            config: Arc::new(self),
            held: Arc::new(Mutex::new(Vec::new())),
            received: Arc::new(Mutex::new(Vec::new())),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for MockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A backend that completes every call in-process.
///
/// Clones share state, so a test can keep a clone to inspect the backend after
/// handing it to `Bindings`.
#[derive(Clone)]
pub struct MockBackend {
    config: Arc<MockBuilder>,
    held: Arc<Mutex<Vec<(OperationResult, Completion)>>>,
    received: Arc<Mutex<Vec<ApplicationDescriptor>>>,
    fired: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn builder() -> MockBuilder {
        MockBuilder::new()
    }

    /// Number of trampoline invocations that have returned.
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    /// Number of completions queued by `hold`.
    pub fn held(&self) -> usize {
        self.held.lock().map(|held| held.len()).unwrap_or_default()
    }

    /// Descriptors as decoded on this side of the boundary, in arrival order.
    pub fn received(&self) -> Vec<ApplicationDescriptor> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Delivers every held completion on the current thread. Returns how many
    /// were delivered.
    pub fn fire_held(&self) -> usize {
        let drained: Vec<(OperationResult, Completion)> = match self.held.lock() {
            Ok(mut held) => held.drain(..).collect(),
            Err(_) => return 0,
        };

        let count = drained.len();
        for (result, completion) in drained {
            self.complete_with(result, completion);
        }
        count
    }

    /// Copies the descriptor out of caller memory; the pointer dies when the
    /// entry point returns.
    fn receive(&self, app: &FfiAppInfo) -> (OperationResult, Option<ApplicationDescriptor>) {
        // SAFETY: the adapter keeps `app.name` alive until the entry point returns.
        match unsafe { app.decode() } {
            Ok(descriptor) => {
                if let Ok(mut received) = self.received.lock() {
                    received.push(descriptor.clone());
                }
                (self.config.outcome.result(), Some(descriptor))
            }
            Err(e) => (OperationResult::failure(INVALID_APP_INFO, e.to_string()), None),
        }
    }

    fn schedule(&self, result: OperationResult, completion: Completion) {
        if self.config.hold {
            if let Ok(mut held) = self.held.lock() {
                held.push((result, completion));
            }
            return;
        }

        let backend = self.clone();
        let delay = self.delay();
        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            backend.complete_with(result, completion);
        });
    }

    fn delay(&self) -> Duration {
        let min = self.config.min_latency;
        let max = self.config.max_latency;
        if max <= min {
            return min;
        }
        let micros = rand::thread_rng().gen_range(min.as_micros() as u64..=max.as_micros() as u64);
        Duration::from_micros(micros)
    }

    fn complete_with(&self, result: OperationResult, completion: Completion) {
        let wire = result.to_wire();
        let raw = wire.raw();

        match completion {
            Completion::Unit { ctx, cb } => {
                // SAFETY: `raw` and its message outlive the call.
                unsafe { cb(ctx_ptr(ctx), &raw) };
            }
            Completion::Int { ctx, cb, id } => {
                // SAFETY: as above.
                unsafe { cb(ctx_ptr(ctx), &raw, id) };
            }
            Completion::Text { ctx, cb, name } => {
                let mut buf = name.into_bytes();
                buf.push(0);
                // SAFETY: `buf` is NUL-terminated and outlives the call.
                unsafe { cb(ctx_ptr(ctx), &raw, buf.as_ptr().cast::<c_char>()) };
                buf.fill(0);
            }
        }

        drop(wire);
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

fn ctx_ptr(ctx: usize) -> *mut c_void {
    std::ptr::without_provenance_mut(ctx)
}

impl Backend for MockBackend {
    fn register_app(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbUnit) {
        let (result, _) = self.receive(app);
        self.schedule(result, Completion::Unit { ctx: ctx.addr(), cb });
    }

    fn get_app_id(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbI32) {
        let (result, descriptor) = self.receive(app);
        let id = match (&descriptor, result.is_ok()) {
            (Some(descriptor), true) => descriptor.id(),
            _ => 0,
        };
        self.schedule(result, Completion::Int { ctx: ctx.addr(), cb, id });
    }

    fn get_app_name(&self, app: &FfiAppInfo, ctx: *mut c_void, cb: CbString) {
        let (result, descriptor) = self.receive(app);
        let name = match (descriptor, result.is_ok()) {
            (Some(descriptor), true) => descriptor.name().to_owned(),
            _ => String::new(),
        };
        self.schedule(result, Completion::Text { ctx: ctx.addr(), cb, name });
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("config", &self.config)
            .field("fired", &self.fired())
            .finish_non_exhaustive()
    }
}

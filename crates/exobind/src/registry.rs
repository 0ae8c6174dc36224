//! # Handle Registry
//!
//! Correlates outstanding native calls with the callbacks waiting on them.
//!
//! A callback is moved into the registry under a fresh `Token` when a call is
//! issued, and moved back out exactly once: when the backend fires the matching
//! trampoline, or when the registry releases it during teardown. Only the token
//! crosses the boundary.
//!
//! Trampolines receive nothing but the token, so every registry enrolls itself in
//! a process-wide directory under its `RegistryId`, and that id is packed into the
//! upper bits of each token it mints. Separate registries never share tokens,
//! which keeps them isolated from each other (one per `Bindings`, one per test).
//!
//! ## Token layout
//!
//! `[registry: 16 bits][sequence: 48 bits]`. Registry ids and sequences both start
//! at 1, so a token is never zero and a null context pointer never resolves.
//!
//! Ids return to a free list when their registry is dropped. Sequences come from
//! one process-wide counter, so a registry that inherits a recycled id never holds
//! an entry for a token minted before it existed.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("exobind packs tokens into pointer-sized context values and requires a 64-bit target");

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::wire::OperationResult;

const SEQ_BITS: u32 = 48;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

/// Every live registry, by id. Entries are weak: the owner decides the lifetime.
static DIRECTORY: LazyLock<DashMap<u16, Weak<Registry>>> = LazyLock::new(DashMap::new);
static NEXT_REGISTRY: AtomicU32 = AtomicU32::new(1);
static FREE_IDS: Mutex<Vec<u16>> = Mutex::new(Vec::new());
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn allocate_id() -> Option<RegistryId> {
    let recycled = FREE_IDS.lock().unwrap_or_else(PoisonError::into_inner).pop();
    if let Some(id) = recycled {
        return Some(RegistryId(id));
    }

    // Stop counting once past the id space so the counter itself never wraps.
    let raw = NEXT_REGISTRY
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| (n <= u32::from(u16::MAX)).then_some(n + 1))
        .ok()?;
    u16::try_from(raw).ok().map(RegistryId)
}

fn recycle_id(id: RegistryId) {
    FREE_IDS.lock().unwrap_or_else(PoisonError::into_inner).push(id.0);
}

/// Strong type for registry identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct RegistryId(pub u16);

impl std::fmt::Display for RegistryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "registry-{}", self.0)
    }
}

/// Opaque reference to a pending callback, carried across the boundary as the
/// native `void* ctx`.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct Token(u64);

impl Token {
    fn new(registry: RegistryId, seq: u64) -> Self {
        Self((u64::from(registry.0) << SEQ_BITS) | (seq & SEQ_MASK))
    }

    pub fn registry(self) -> RegistryId {
        RegistryId((self.0 >> SEQ_BITS) as u16)
    }

    pub fn seq(self) -> u64 {
        self.0 & SEQ_MASK
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// The context value handed to the backend. It is never dereferenced.
    pub fn into_ctx(self) -> *mut c_void {
        std::ptr::without_provenance_mut(self.0 as usize)
    }

    pub fn from_ctx(ctx: *mut c_void) -> Self {
        Self(ctx.addr() as u64)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token-{}:{}", self.registry().0, self.seq())
    }
}

/// A caller callback, boxed for storage.
pub type ResultFn<A> = Box<dyn FnOnce(OperationResult, A) + Send + 'static>;

/// The result shapes a trampoline can deliver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Shape {
    Unit,
    Int,
    Text,
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit => write!(f, "()"),
            Self::Int => write!(f, "i32"),
            Self::Text => write!(f, "text"),
        }
    }
}

/// A stored callback, tagged with the argument it expects.
pub enum Callback {
    Unit(ResultFn<()>),
    Int(ResultFn<i32>),
    Text(ResultFn<String>),
}

impl Callback {
    pub fn shape(&self) -> Shape {
        match self {
            Self::Unit(_) => Shape::Unit,
            Self::Int(_) => Shape::Int,
            Self::Text(_) => Shape::Text,
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callback({})", self.shape())
    }
}

/// The backend broke the callback protocol.
///
/// Never retried: the offending invocation is logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Token was never issued by this registry, was already fired, or was released.
    UnknownToken(Token),
    /// Token names a registry that no longer exists.
    UnknownRegistry(Token),
    /// Token was fired through a trampoline of the wrong shape. The entry is kept.
    ShapeMismatch { token: Token, registered: Shape, fired: Shape },
    /// Trampoline received a null result pointer.
    NullResult(Token),
    /// Text trampoline received a null argument pointer.
    NullArgument(Token),
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownToken(t) => write!(f, "unknown or already consumed {}", t),
            Self::UnknownRegistry(t) => write!(f, "{} belongs to a registry that no longer exists", t),
            Self::ShapeMismatch { token, registered, fired } => {
                write!(f, "{} fired as {} but was registered as {}", token, fired, registered)
            }
            Self::NullResult(t) => write!(f, "null result pointer for {}", t),
            Self::NullArgument(t) => write!(f, "null argument pointer for {}", t),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

/// Every 16-bit registry id is held by a live registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryExhausted;

impl std::fmt::Display for RegistryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all registry ids are held by live registries")
    }
}

impl std::error::Error for RegistryExhausted {}

pub type Result<T> = std::result::Result<T, ProtocolViolation>;

/// Counters for verifying that every token reached a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    /// Tokens whose callback was invoked.
    pub fired: u64,
    pub released: u64,
    /// Tokens consumed by a violation; their callback was dropped unrun.
    pub discarded: u64,
    pub violations: u64,
    pub outstanding: usize,
}

/// A table entry. The shape lives outside the lock so matching never touches
/// the callback; the lock only makes the entry shareable and is never held
/// while caller code runs.
struct Slot {
    shape: Shape,
    callback: Mutex<Callback>,
}

impl Slot {
    fn new(callback: Callback) -> Self {
        Self { shape: callback.shape(), callback: Mutex::new(callback) }
    }

    fn into_callback(self) -> Callback {
        self.callback.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Token to callback table with one-shot consumption.
///
/// All operations are short critical sections on a sharded map. None of them run
/// caller code while a shard is locked: callbacks leave the table before anyone
/// invokes or drops them.
pub struct Registry {
    id: RegistryId,
    pending: DashMap<u64, Slot>,
    registered: AtomicU64,
    fired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    violations: AtomicU64,
}

impl Registry {
    /// Creates a registry and enrolls it in the process-wide directory.
    ///
    /// The registry leaves the directory, and its id becomes reusable, when the
    /// last `Arc` is dropped.
    pub fn new() -> std::result::Result<Arc<Self>, RegistryExhausted> {
        let id = allocate_id().ok_or(RegistryExhausted)?;

        let registry = Arc::new(Self {
            id,
            pending: DashMap::new(),
            registered: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        });

        DIRECTORY.insert(id.0, Arc::downgrade(&registry));
        debug!(registry = %id, "registry enrolled");
        Ok(registry)
    }

    /// Finds the live registry that minted `token`.
    pub fn lookup(token: Token) -> Result<Arc<Self>> {
        DIRECTORY
            .get(&token.registry().0)
            .and_then(|entry| entry.value().upgrade())
            .ok_or(ProtocolViolation::UnknownRegistry(token))
    }

    pub fn id(&self) -> RegistryId {
        self.id
    }

    /// Stores `callback` under a fresh token.
    pub fn register(&self, callback: Callback) -> Token {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        debug_assert!(seq <= SEQ_MASK, "token sequence overflow");
        let token = Token::new(self.id, seq);

        let shape = callback.shape();
        self.pending.insert(seq, Slot::new(callback));
        self.registered.fetch_add(1, Ordering::Relaxed);

        debug!(%token, %shape, "callback registered");
        token
    }

    /// Atomically removes and returns the callback for `token`.
    ///
    /// Whoever takes the callback records its fate with `note_fired` or
    /// `note_discarded`.
    pub fn resolve_and_remove(&self, token: Token) -> Result<Callback> {
        if token.registry() != self.id {
            return Err(ProtocolViolation::UnknownToken(token));
        }

        let (_, slot) = self
            .pending
            .remove(&token.seq())
            .ok_or(ProtocolViolation::UnknownToken(token))?;

        Ok(slot.into_callback())
    }

    /// Like `resolve_and_remove`, but only consumes the entry if it has `shape`.
    ///
    /// A mismatched entry stays in the table so the correct trampoline can
    /// still fire it.
    pub fn resolve_shaped(&self, token: Token, shape: Shape) -> Result<Callback> {
        if token.registry() != self.id {
            return Err(ProtocolViolation::UnknownToken(token));
        }

        let seq = token.seq();
        match self.pending.remove_if(&seq, |_, slot| slot.shape == shape) {
            Some((_, slot)) => Ok(slot.into_callback()),
            None => {
                let registered = self.pending.get(&seq).map(|entry| entry.value().shape);
                match registered {
                    Some(registered) => Err(ProtocolViolation::ShapeMismatch { token, registered, fired: shape }),
                    None => Err(ProtocolViolation::UnknownToken(token)),
                }
            }
        }
    }

    /// Removes `token` without firing it. Returns whether it was still pending.
    ///
    /// The original request will never receive a result.
    pub fn release(&self, token: Token) -> bool {
        if token.registry() != self.id {
            return false;
        }

        let Some((_, slot)) = self.pending.remove(&token.seq()) else {
            return false;
        };

        self.released.fetch_add(1, Ordering::Relaxed);
        warn!(%token, shape = %slot.shape, "released pending callback without firing");
        drop(slot);
        true
    }

    /// Releases every pending token. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();

        let mut released = 0;
        for key in keys {
            if let Some((_, slot)) = self.pending.remove(&key) {
                drop(slot);
                released += 1;
            }
        }

        if released > 0 {
            self.released.fetch_add(released as u64, Ordering::Relaxed);
            warn!(registry = %self.id, released, "teardown released pending callbacks");
        }
        released
    }

    /// Records that the callback for `token` is about to run.
    pub fn note_fired(&self, token: Token) {
        debug_assert_eq!(token.registry(), self.id);
        self.fired.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a violation that consumed a token without running its callback.
    pub fn note_discarded(&self, violation: &ProtocolViolation) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.note_violation(violation);
    }

    /// Records a violation the trampoline detected and logs it.
    pub fn note_violation(&self, violation: &ProtocolViolation) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        error!(registry = %self.id, error = %violation, "protocol violation; dropping invocation");
    }

    pub fn contains(&self, token: Token) -> bool {
        token.registry() == self.id && self.pending.contains_key(&token.seq())
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.registered.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            outstanding: self.pending.len(),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        DIRECTORY.remove(&self.id.0);
        recycle_id(self.id);
        self.release_all();
        debug!(registry = %self.id, "registry retired");
    }
}

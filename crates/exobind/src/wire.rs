//! # Wire Structs
//!
//! The layouts exchanged with the native backend (`backend.h`), and the owned
//! values they are built from and decoded into.
//!
//! ## Invariants
//!
//! - **Fixed Credential**: a `Credential` is exactly 8 bytes. Any other length is
//!   rejected when the value is built, never padded or truncated on the wire.
//! - **Lossless Text**: names never contain an interior NUL, so the NUL-terminated
//!   wire form carries the whole string.
//! - **Borrowed Pointers**: an `EncodedDescriptor` borrows its descriptor, so the
//!   name pointer it hands out cannot outlive the string it points into.

use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::c_char;
use std::marker::PhantomData;

/// Length of a credential on the wire.
pub const CREDENTIAL_LEN: usize = 8;

/// Malformed input, rejected before anything crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// Credential input was not exactly `CREDENTIAL_LEN` bytes.
    CredentialLength { found: usize },
    /// Display name contains a NUL byte, which would truncate the wire string.
    NameContainsNul { position: usize },
    /// Wire descriptor carried a null name pointer.
    NullName,
}

impl std::fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CredentialLength { found } => {
                write!(f, "credential must be exactly {} bytes, got {}", CREDENTIAL_LEN, found)
            }
            Self::NameContainsNul { position } => {
                write!(f, "name contains a NUL byte at offset {}", position)
            }
            Self::NullName => write!(f, "descriptor name pointer is null"),
        }
    }
}

impl std::error::Error for ConstructionError {}

pub type Result<T> = std::result::Result<T, ConstructionError>;

/// Fixed-size secret associated with an application.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential([u8; CREDENTIAL_LEN]);

impl Credential {
    pub const fn new(bytes: [u8; CREDENTIAL_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a credential from a slice of exactly `CREDENTIAL_LEN` bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let fixed: [u8; CREDENTIAL_LEN] = bytes
            .try_into()
            .map_err(|_| ConstructionError::CredentialLength { found: bytes.len() })?;
        Ok(Self(fixed))
    }

    pub fn as_bytes(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.0
    }
}

impl From<[u8; CREDENTIAL_LEN]> for Credential {
    fn from(bytes: [u8; CREDENTIAL_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Credential {
    type Error = ConstructionError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::from_slice(bytes)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// The application identification record sent with every request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationDescriptor {
    id: i32,
    name: String,
    wire_name: CString,
    credential: Credential,
}

impl ApplicationDescriptor {
    pub fn new(id: i32, name: impl Into<String>, credential: Credential) -> Result<Self> {
        let name = name.into();
        let wire_name = CString::new(name.as_str())
            .map_err(|e| ConstructionError::NameContainsNul { position: e.nul_position() })?;
        Ok(Self { id, name, wire_name, credential })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Lays the descriptor out the way the backend reads it.
    ///
    /// The returned value borrows `self`: the name pointer inside it stays valid
    /// exactly as long as the borrow does.
    pub fn encode(&self) -> EncodedDescriptor<'_> {
        EncodedDescriptor {
            raw: FfiAppInfo {
                id: self.id,
                name: self.wire_name.as_ptr(),
                key: FfiKey { bytes: self.credential.0 },
            },
            _descriptor: PhantomData,
        }
    }
}

/// `struct Key { int8_t bytes[8]; }`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FfiKey {
    pub bytes: [u8; CREDENTIAL_LEN],
}

/// `struct AppInfo { int32_t id; char* name; Key key; }`
#[repr(C)]
#[derive(Debug)]
pub struct FfiAppInfo {
    pub id: i32,
    pub name: *const c_char,
    pub key: FfiKey,
}

impl FfiAppInfo {
    /// Decodes the descriptor as the receiving side sees it, copying the name.
    ///
    /// # Safety
    ///
    /// `self.name` must be null or point to a NUL-terminated string that stays
    /// valid for the duration of this call.
    pub unsafe fn decode(&self) -> Result<ApplicationDescriptor> {
        // SAFETY: forwarded from the caller.
        let name = unsafe { copy_text(self.name) }.ok_or(ConstructionError::NullName)?;
        ApplicationDescriptor::new(self.id, name, Credential(self.key.bytes))
    }
}

/// A descriptor in wire layout, tied to the descriptor it was encoded from.
#[derive(Debug)]
pub struct EncodedDescriptor<'a> {
    raw: FfiAppInfo,
    _descriptor: PhantomData<&'a ApplicationDescriptor>,
}

impl EncodedDescriptor<'_> {
    pub fn as_ffi(&self) -> &FfiAppInfo {
        &self.raw
    }
}

/// `struct FfiResult { int32_t error_code; char* error; }`
#[repr(C)]
#[derive(Debug)]
pub struct FfiResult {
    pub error_code: i32,
    pub error: *const c_char,
}

/// The backend's verdict on a completed operation.
///
/// A nonzero `code` is a backend-defined failure cause. It is delivered to the
/// callback like any other result, never raised as an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    pub code: i32,
    pub message: String,
}

impl OperationResult {
    pub const SUCCESS: i32 = 0;

    /// The result the reference backend reports on success.
    pub fn ok() -> Self {
        Self { code: Self::SUCCESS, message: "OK".into() }
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::SUCCESS
    }

    /// Copies a wire result into owned memory. A null message decodes as empty.
    ///
    /// # Safety
    ///
    /// `raw.error` must be null or point to a NUL-terminated string that stays
    /// valid for the duration of this call.
    pub unsafe fn decode(raw: &FfiResult) -> Self {
        // SAFETY: forwarded from the caller.
        let message = unsafe { copy_text(raw.error) }.unwrap_or_default();
        Self { code: raw.error_code, message }
    }

    /// Builds the wire form a backend hands to a trampoline.
    ///
    /// The message is cut at its first NUL, if any.
    pub fn to_wire(&self) -> OwnedFfiResult {
        let text = self.message.split('\0').next().unwrap_or_default();
        let message = CString::new(text).unwrap_or_default();
        OwnedFfiResult { code: self.code, message }
    }
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Owns the message buffer behind an `FfiResult`.
#[derive(Debug)]
pub struct OwnedFfiResult {
    code: i32,
    message: CString,
}

impl OwnedFfiResult {
    /// The wire view. Its `error` pointer is valid while `self` is alive.
    pub fn raw(&self) -> FfiResult {
        FfiResult { error_code: self.code, error: self.message.as_ptr() }
    }
}

/// Copies a NUL-terminated native string into owned memory.
///
/// Invalid UTF-8 is replaced rather than rejected. Returns `None` for null.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays valid for
/// the duration of this call.
pub unsafe fn copy_text(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    let text = unsafe { CStr::from_ptr(ptr) };
    Some(text.to_string_lossy().into_owned())
}

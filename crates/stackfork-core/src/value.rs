//! Values that cross the replay boundary
//!
//! A replayed frame hands its return value to the next frame in the chain
//! through a [`ReturnValue`]. The representation is chosen by the frame's
//! [`ReturnKind`] tag, which also selects the resume primitive used for it.
//!
//! Non-local exits of native code (a committed suspension unwinding to its
//! frame boundary, or a raised exception) travel as [`Unwind`] so that `?`
//! propagates both.

use crate::SuspendError;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Return values
// ============================================================================

/// How a captured frame carries its return value forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// Frame returns nothing
    Void,
    /// Frame returns a heap reference
    Reference,
    /// Frame returns an integer/pointer-sized value in a register
    Scalar,
    /// Frame returns through a caller-provided buffer (not supported by replay)
    Indirect,
}

/// Reference to a heap object owned by the embedding runtime
#[derive(Clone)]
pub struct HeapRef(Arc<dyn Any + Send + Sync>);

impl HeapRef {
    /// Wrap a value as a heap reference
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        HeapRef(Arc::new(value))
    }

    /// Borrow the referenced object as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether both references point at the same object
    pub fn ptr_eq(&self, other: &HeapRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Value handed from one replayed frame to the next
#[derive(Debug, Clone, Default)]
pub enum ReturnValue {
    /// No value
    #[default]
    None,
    /// A heap reference
    Reference(HeapRef),
    /// A raw integer or pointer-sized value
    Scalar(usize),
}

impl ReturnValue {
    /// Tag describing this value's representation
    pub fn kind(&self) -> ReturnKind {
        match self {
            ReturnValue::None => ReturnKind::Void,
            ReturnValue::Reference(_) => ReturnKind::Reference,
            ReturnValue::Scalar(_) => ReturnKind::Scalar,
        }
    }

    /// Move the value out, leaving `None` behind
    pub fn take(&mut self) -> ReturnValue {
        std::mem::take(self)
    }

    /// The scalar payload, if this is a scalar
    pub fn as_scalar(&self) -> Option<usize> {
        match self {
            ReturnValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// The reference payload, if this is a reference
    pub fn as_reference(&self) -> Option<&HeapRef> {
        match self {
            ReturnValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    fn mismatch(self, expected: ReturnKind) -> SuspendError {
        SuspendError::ReturnMismatch {
            expected,
            actual: self.kind(),
        }
    }
}

/// Conversion out of a [`ReturnValue`] into a typed result slot
pub trait FromReturnValue: Sized + Send + 'static {
    /// Representation the outermost frame must use to fill the slot
    const KIND: ReturnKind;

    /// Convert, failing with [`SuspendError::ReturnMismatch`] on the wrong tag
    fn from_return(value: ReturnValue) -> Result<Self, SuspendError>;
}

/// Conversion of a typed value into a [`ReturnValue`]
pub trait IntoReturnValue {
    /// Convert into the value carried across the replay boundary
    fn into_return(self) -> ReturnValue;
}

impl FromReturnValue for () {
    const KIND: ReturnKind = ReturnKind::Void;

    fn from_return(value: ReturnValue) -> Result<Self, SuspendError> {
        match value {
            ReturnValue::None => Ok(()),
            other => Err(other.mismatch(ReturnKind::Void)),
        }
    }
}

impl IntoReturnValue for () {
    fn into_return(self) -> ReturnValue {
        ReturnValue::None
    }
}

impl FromReturnValue for HeapRef {
    const KIND: ReturnKind = ReturnKind::Reference;

    fn from_return(value: ReturnValue) -> Result<Self, SuspendError> {
        match value {
            ReturnValue::Reference(r) => Ok(r),
            other => Err(other.mismatch(ReturnKind::Reference)),
        }
    }
}

impl IntoReturnValue for HeapRef {
    fn into_return(self) -> ReturnValue {
        ReturnValue::Reference(self)
    }
}

impl IntoReturnValue for ReturnValue {
    fn into_return(self) -> ReturnValue {
        self
    }
}

macro_rules! scalar_return {
    ($($ty:ty),*) => {
        $(
            impl FromReturnValue for $ty {
                const KIND: ReturnKind = ReturnKind::Scalar;

                fn from_return(value: ReturnValue) -> Result<Self, SuspendError> {
                    match value {
                        // Register-width payload; narrowing mirrors the native ABI.
                        ReturnValue::Scalar(raw) => Ok(raw as isize as $ty),
                        other => Err(other.mismatch(ReturnKind::Scalar)),
                    }
                }
            }

            impl IntoReturnValue for $ty {
                fn into_return(self) -> ReturnValue {
                    ReturnValue::Scalar(self as isize as usize)
                }
            }
        )*
    };
}

scalar_return!(usize, isize, u64, i64, u32, i32, u16, i16, u8, i8);

impl FromReturnValue for bool {
    const KIND: ReturnKind = ReturnKind::Scalar;

    fn from_return(value: ReturnValue) -> Result<Self, SuspendError> {
        match value {
            ReturnValue::Scalar(raw) => Ok(raw != 0),
            other => Err(other.mismatch(ReturnKind::Scalar)),
        }
    }
}

impl IntoReturnValue for bool {
    fn into_return(self) -> ReturnValue {
        ReturnValue::Scalar(self as usize)
    }
}

// ============================================================================
// Exceptions and non-local exits
// ============================================================================

/// An exception raised by native code or by an awaited operation
///
/// Clones share identity: re-raising a stored exception hands back the same
/// object, which [`Exception::same_as`] can check.
#[derive(Clone)]
pub struct Exception(Arc<dyn std::error::Error + Send + Sync + 'static>);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Raised(String);

impl Exception {
    /// Wrap an error value
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Exception(Arc::new(error))
    }

    /// Raise a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Exception::new(Raised(message.into()))
    }

    /// Whether both values are the same raised exception
    pub fn same_as(&self, other: &Exception) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    /// Borrow the underlying error as `E`
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// The runtime error this exception carries, if it is one
    pub fn as_suspend_error(&self) -> Option<&SuspendError> {
        self.downcast_ref::<SuspendError>()
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exception").field(&self.0).finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<SuspendError> for Exception {
    fn from(error: SuspendError) -> Self {
        Exception::new(error)
    }
}

/// Non-local exit out of native code
#[derive(Debug, Clone)]
pub enum Unwind {
    /// A suspension committed; unwind to the enclosing suspension frame
    Suspend,
    /// An exception was raised
    Throw(Exception),
}

impl Unwind {
    /// The raised exception, if this is a throw
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Unwind::Throw(e) => Some(e),
            Unwind::Suspend => None,
        }
    }
}

impl From<Exception> for Unwind {
    fn from(exception: Exception) -> Self {
        Unwind::Throw(exception)
    }
}

impl From<SuspendError> for Unwind {
    fn from(error: SuspendError) -> Self {
        Unwind::Throw(error.into())
    }
}

/// Result of running native code that may suspend or raise
pub type Native<T> = Result<T, Unwind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip_keeps_sign() {
        let v = (-7i32).into_return();
        assert_eq!(v.kind(), ReturnKind::Scalar);
        assert_eq!(i32::from_return(v).unwrap(), -7);
    }

    #[test]
    fn test_kind_mismatch() {
        let err = HeapRef::from_return(ReturnValue::Scalar(1)).unwrap_err();
        assert!(matches!(
            err,
            SuspendError::ReturnMismatch {
                expected: ReturnKind::Reference,
                actual: ReturnKind::Scalar
            }
        ));
    }

    #[test]
    fn test_heap_ref_identity() {
        let a = HeapRef::new(String::from("frame"));
        let b = a.clone();
        let c = HeapRef::new(String::from("frame"));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(b.downcast_ref::<String>().unwrap(), "frame");
    }

    #[test]
    fn test_exception_identity_survives_clone() {
        let e = Exception::msg("boom");
        let again = e.clone();
        assert!(e.same_as(&again));
        assert!(!e.same_as(&Exception::msg("boom")));
        assert_eq!(e.to_string(), "boom");
    }

    #[test]
    fn test_take_leaves_none() {
        let mut v = ReturnValue::Scalar(3);
        assert_eq!(v.take().as_scalar(), Some(3));
        assert_eq!(v.kind(), ReturnKind::Void);
    }
}

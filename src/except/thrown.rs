//! The worker's in-flight exception: a fixed buffer plus the type it holds.

use core::any::{type_name, TypeId};
use core::mem::{align_of, size_of, MaybeUninit};
use core::{fmt, ptr};
use std::cell::Cell;

/// The largest value, in bytes, that can be thrown.
pub const MAX_THROWABLE_SIZE: usize = 128;

/// The strictest alignment a thrown value may require.
pub const MAX_THROWABLE_ALIGN: usize = 16;

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Payload([MaybeUninit<u8>; MAX_THROWABLE_SIZE]);

/// Identifies the type of a thrown value. Catch clauses match on it.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A copy of a thrown value together with its [`TypeTag`].
#[derive(Clone, Copy)]
pub struct Thrown {
    tag: TypeTag,
    payload: Payload,
}

impl Thrown {
    pub(crate) fn new<T: Copy + 'static>(value: T) -> Self {
        const {
            assert!(
                size_of::<T>() <= MAX_THROWABLE_SIZE,
                "thrown value exceeds MAX_THROWABLE_SIZE"
            );
            assert!(
                align_of::<T>() <= MAX_THROWABLE_ALIGN,
                "thrown value is aligned stricter than MAX_THROWABLE_ALIGN"
            );
        }

        let mut payload = Payload([MaybeUninit::uninit(); MAX_THROWABLE_SIZE]);
        // SAFETY: The buffer is large and aligned enough for T, checked above.
        unsafe { ptr::write(payload.0.as_mut_ptr().cast::<T>(), value) };

        Self {
            tag: TypeTag::of::<T>(),
            payload,
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn type_name(&self) -> &'static str {
        self.tag.name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.tag.id == TypeId::of::<T>()
    }

    /// The thrown value, if it is a `T`.
    pub fn downcast<T: Copy + 'static>(&self) -> Option<T> {
        if self.is::<T>() {
            // SAFETY: The tag says the payload holds a T.
            Some(unsafe { self.read_unchecked() })
        } else {
            None
        }
    }

    /// # Safety
    ///
    /// The payload must hold a `T`, i.e. `self.is::<T>()`.
    pub(crate) unsafe fn read_unchecked<T: Copy>(&self) -> T {
        // SAFETY: Guaranteed by the caller; the buffer is aligned for any
        // throwable type.
        unsafe { ptr::read(self.payload.0.as_ptr().cast::<T>()) }
    }
}

impl fmt::Debug for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thrown").field("type", &self.tag).finish()
    }
}

thread_local! {
    static CURRENT: Cell<Option<Thrown>> = const { Cell::new(None) };
}

pub(crate) fn store(thrown: Thrown) {
    CURRENT.set(Some(thrown));
}

/// The exception most recently thrown on this worker.
///
/// Rethrowing and propagating leave it untouched, so inside a catch handler
/// or a hook this is the value being handled.
pub fn current() -> Option<Thrown> {
    CURRENT.get()
}

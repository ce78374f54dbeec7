//! The seam between the allocator and the primitive that grows its backing
//! memory region.
use core::{marker::PhantomData, mem::MaybeUninit, ptr::NonNull};

use crate::seg::ALIGNMENT;

/// A monotonically growing, contiguous memory region.
///
/// This is the only collaborator the allocator consumes. It models an
/// `sbrk`-like primitive: each call extends the same region by `len` bytes
/// and returns the starting address of the newly added bytes. The allocator,
/// not the source, tracks the current high-water mark.
///
/// # Safety
///
/// Implementations must uphold the following for the allocator's internal
/// pointer arithmetic to be sound:
///
///  - A successful `extend(len)` hands out exactly `len` bytes of writable
///    memory that remain valid and unaliased for the source's lifetime.
///    There is no way to return them.
///
///  - Successive successful calls return contiguous addresses: the region
///    grows at its end and never moves.
///
///  - The first successful call returns an address aligned to [`ALIGNMENT`].
///    (The allocator only ever requests multiples of [`ALIGNMENT`], so later
///    calls stay aligned by construction.)
pub unsafe trait RegionSource {
    /// Grow the region by `len` bytes, returning the start of the new bytes,
    /// or `None` if the underlying memory is exhausted.
    ///
    /// Failure must have no partial effect.
    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// A [`RegionSource`] bump-growing inside a caller-provided buffer.
///
/// This is the easiest way to drive [`Segfit`] from a `static` array or an
/// arena obtained from another allocator.
///
/// [`Segfit`]: crate::Segfit
///
/// # Examples
///
/// ```
/// use segfit::{ArenaSource, Segfit};
/// use std::mem::MaybeUninit;
///
/// let mut arena = [MaybeUninit::uninit(); 4096];
/// let mut heap: Segfit<_> = Segfit::new(ArenaSource::new(&mut arena));
/// assert!(heap.allocate(128).is_some());
/// ```
#[derive(Debug)]
pub struct ArenaSource<'a> {
    start: NonNull<u8>,
    len: usize,
    used: usize,
    _phantom: PhantomData<&'a mut [MaybeUninit<u8>]>,
}

// Safety: `ArenaSource` logically owns the borrowed buffer, which has no
//         interior mutability.
unsafe impl Send for ArenaSource<'_> {}

impl<'a> ArenaSource<'a> {
    /// Construct an `ArenaSource` over `arena`.
    ///
    /// The usable capacity is `arena.len()` minus at most `ALIGNMENT - 1`
    /// bytes lost to aligning the start address.
    pub fn new(arena: &'a mut [MaybeUninit<u8>]) -> Self {
        let unaligned = arena.as_mut_ptr() as *mut u8;
        let start = (unaligned as usize).wrapping_add(ALIGNMENT - 1) & !(ALIGNMENT - 1);
        let skip = start.wrapping_sub(unaligned as usize);
        Self {
            // Safety: `start` is in or one-past `arena`, hence non-null
            start: unsafe { NonNull::new_unchecked(start as *mut u8) },
            len: arena.len().saturating_sub(skip),
            used: 0,
            _phantom: PhantomData,
        }
    }

    /// The number of bytes not yet handed to the allocator.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.used
    }
}

unsafe impl RegionSource for ArenaSource<'_> {
    #[inline]
    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        if len > self.len - self.used {
            return None;
        }
        let ptr = NonNull::new_unchecked(self.start.as_ptr().add(self.used));
        self.used += len;
        Some(ptr)
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use crate::Init;

        /// A [`RegionSource`] growing the process data segment via
        /// `sbrk(2)`.
        ///
        /// The process break is shared, global state: this source is only
        /// sound while nothing else in the process moves the break, and only
        /// one `SbrkSource`-backed allocator may exist at a time.
        #[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
        #[derive(Debug)]
        pub struct SbrkSource(());

        impl Init for SbrkSource {
            const INIT: Self = Self(());
        }

        impl const_default1::ConstDefault for SbrkSource {
            const DEFAULT: Self = Self(());
        }

        unsafe impl RegionSource for SbrkSource {
            unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
                // The break starts wherever the platform left it; pad the
                // first extension up to `ALIGNMENT`. Once aligned it stays
                // aligned because `len` is always a multiple of `ALIGNMENT`.
                let brk = libc::sbrk(0);
                if brk as isize == -1 {
                    return None;
                }
                let pad = (brk as usize).wrapping_neg() & (ALIGNMENT - 1);
                let total = len.checked_add(pad)?;
                if total > isize::MAX as usize {
                    return None;
                }

                let old = libc::sbrk(total as _);
                if old as isize == -1 {
                    return None;
                }
                debug_assert_eq!(old, brk);
                NonNull::new((old as *mut u8).add(pad))
            }
        }
    }
}

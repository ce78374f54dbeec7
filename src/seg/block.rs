//! Block byte layout and boundary-tag primitives. The core implementation of
//! neighbor addressing for `Segfit`.
use core::{mem, ptr::NonNull};

/// The base word size. Boundary tags are one word each.
pub(super) const WORD: usize = mem::size_of::<usize>();

/// The alignment unit. Payload addresses and block sizes are multiples of
/// this.
pub const ALIGNMENT: usize = WORD * 2;

/// The per-block overhead: a header tag plus a footer tag.
pub(super) const OVERHEAD: usize = WORD * 2;

/// The minimum size of any block: header, footer, and the two free-list link
/// words that live in a free block's payload.
pub const MIN_BLOCK_SIZE: usize = WORD * 4;

/// The bit of a boundary tag indicating whether the block is allocated.
pub(super) const USED: usize = 1;

/// The bits of a boundary tag representing the block's size.
pub(super) const SIZE_MASK: usize = !(ALIGNMENT - 1);

/// A block, identified by the address of its header tag.
///
/// `Block` is a plain address; every accessor is `unsafe` because nothing
/// about the address is known to the type system. The layout is:
///
/// ```text
/// header       payload                                footer
/// [size|used] [prev_free][next_free][ ... ] ......... [size|used]
///             ^ the address handed to callers
/// ```
///
/// The two link words are only meaningful while the block is free; an
/// allocated block's payload covers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(super) struct Block(pub(super) NonNull<u8>);

impl Block {
    #[inline]
    pub(super) fn addr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// The payload address handed to callers.
    #[inline]
    pub(super) fn payload(self) -> NonNull<u8> {
        // Safety: one word past a valid header is still inside the block
        unsafe { NonNull::new_unchecked(self.addr().add(WORD)) }
    }

    /// Recover the block from a payload address previously returned by
    /// `payload`.
    #[inline]
    pub(super) unsafe fn from_payload(ptr: NonNull<u8>) -> Self {
        Self(NonNull::new_unchecked(ptr.as_ptr().sub(WORD)))
    }

    #[inline]
    pub(super) unsafe fn header(self) -> usize {
        *(self.addr() as *const usize)
    }

    /// The footer tag. Located through the size recorded in the header, so
    /// it is only meaningful while the header is intact.
    #[inline]
    pub(super) unsafe fn footer(self) -> usize {
        *(self.addr().add(self.size() - WORD) as *const usize)
    }

    /// The block's total size, including all overhead.
    #[inline]
    pub(super) unsafe fn size(self) -> usize {
        self.header() & SIZE_MASK
    }

    #[inline]
    pub(super) unsafe fn is_used(self) -> bool {
        self.header() & USED != 0
    }

    /// Stamp both boundary tags with `size` and the allocation state.
    ///
    /// # Safety
    ///
    /// The block must own at least `size` bytes starting at its header, and
    /// `size` must be a multiple of [`ALIGNMENT`] no smaller than
    /// [`MIN_BLOCK_SIZE`].
    #[inline]
    pub(super) unsafe fn stamp(self, size: usize, used: bool) {
        debug_assert!(size >= MIN_BLOCK_SIZE);
        debug_assert_eq!(size % ALIGNMENT, 0);
        let tag = size | usize::from(used);
        *(self.addr() as *mut usize) = tag;
        *(self.addr().add(size - WORD) as *mut usize) = tag;
    }

    /// Set or clear the used bit in both tags, leaving the size untouched.
    #[inline]
    pub(super) unsafe fn set_used(self, used: bool) {
        let tag = self.size() | usize::from(used);
        *(self.addr() as *mut usize) = tag;
        *(self.addr().add(self.size() - WORD) as *mut usize) = tag;
    }

    /// The physically following block.
    ///
    /// # Safety
    ///
    /// `self` must not be the epilogue; only the epilogue has no successor.
    #[inline]
    pub(super) unsafe fn next_phys(self) -> Block {
        Block(NonNull::new_unchecked(self.addr().add(self.size())))
    }

    /// The physically preceding block, found via the footer immediately
    /// before this block's header, which always belongs to the predecessor.
    ///
    /// # Safety
    ///
    /// `self` must not be the prologue; only the prologue has no predecessor.
    #[inline]
    pub(super) unsafe fn prev_phys(self) -> Block {
        let prev_size = *(self.addr().sub(WORD) as *const usize) & SIZE_MASK;
        Block(NonNull::new_unchecked(self.addr().sub(prev_size)))
    }

    // The free-list links live in the first two payload words. They are raw
    // pointers with null meaning "end of list".

    #[inline]
    pub(super) unsafe fn prev_free(self) -> Option<Block> {
        NonNull::new(*(self.payload().as_ptr() as *mut *mut u8)).map(Block)
    }

    #[inline]
    pub(super) unsafe fn set_prev_free(self, prev: Option<Block>) {
        *(self.payload().as_ptr() as *mut *mut u8) =
            prev.map_or(core::ptr::null_mut(), Block::addr);
    }

    #[inline]
    pub(super) unsafe fn next_free(self) -> Option<Block> {
        NonNull::new(*(self.payload().as_ptr().add(WORD) as *mut *mut u8)).map(Block)
    }

    #[inline]
    pub(super) unsafe fn set_next_free(self, next: Option<Block>) {
        *(self.payload().as_ptr().add(WORD) as *mut *mut u8) =
            next.map_or(core::ptr::null_mut(), Block::addr);
    }
}

/// Write a zero-sized, always-allocated epilogue header at `at`.
///
/// The epilogue is a bare header word; it has no footer and no payload.
#[inline]
pub(super) unsafe fn write_epilogue(at: *mut u8) {
    *(at as *mut usize) = USED;
}

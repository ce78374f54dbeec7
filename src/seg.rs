//! The segregated-fit allocator core.
use core::{
    fmt,
    ptr::{self, NonNull},
};

use crate::{region::RegionSource, Init};

mod block;
mod check;
pub use self::{
    block::{ALIGNMENT, MIN_BLOCK_SIZE},
    check::Violations,
};
use self::block::{write_epilogue, Block, OVERHEAD, USED, WORD};

/// The default number of size-class buckets. Bucket `i` holds free blocks of
/// size `2^(i-1)..2^i`; the top bucket has no upper bound.
pub const DEFAULT_BUCKETS: usize = 28;

/// The minimum number of bytes the heap grows by. Small requests still grow
/// the heap by this floor amount, amortizing the cost of the growth
/// primitive.
const MIN_EXTEND: usize = 1 << 10;

#[cfg_attr(doc, svgbobdoc::transform)]
/// A segregated-fit heap over a [`RegionSource`].
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   Size-class buckets                       bucket i: size 2^(i-1)..2^i
///        ,-------+-------+-------+-------+-------+-------+----
///        |   0   |   1   |  ...  |   6   |   7   |   8   | ...
///        '-------+-------+-------+---+---+-------+---+---+----
///          never                     |               |
///        populated                   |               '----------,
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶
///   Free lists                       v                          v
///              ,---+---+------,    ,---+---+------,    ,---+---+------,
///              | O | O-+------+--->| O | O |      |    | O |   |      |
///              +---+---+------+    +---+---'------+    +---+---'------+
///                 48 bytes            32 bytes            160 bytes
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Heap          prologue                                  epilogue
///        ,---,---,---+------------+---+------------+-- --+----,
///        |pad| sentinel | block | block | block | block ... | s |
///        '---'---'---+------------+---+------------+-- --+----'
/// ```
/// </center>
///
/// # Properties
///
/// Every block carries a `size | used` boundary tag at both ends, giving
/// constant-time access to both physical neighbors. Adjacent free blocks are
/// merged eagerly, so no two free blocks are ever physically adjacent. The
/// heap is bounded by two always-allocated sentinels (a prologue at the
/// start, a zero-sized epilogue at the growing end) that remove all
/// start-of-heap and end-of-heap special cases from coalescing.
///
/// All state lives in this object; independent heaps are independent
/// `Segfit` values. Every operation takes `&mut self` and completes
/// synchronously; callers needing concurrency must serialize externally.
#[derive(Debug)]
pub struct Segfit<S, const BUCKETS: usize = DEFAULT_BUCKETS> {
    /// Head of the doubly linked free list for each size class.
    buckets: [Option<Block>; BUCKETS],
    extent: Option<Extent>,
    source: S,
}

/// The bounds of the managed heap. The region between `lo` (the prologue
/// header) and `epilogue` is owned by the allocator by construction; there is
/// no separate block registry.
#[derive(Debug)]
struct Extent {
    lo: NonNull<u8>,
    epilogue: Block,
}

// Safety: All blocks directly or indirectly referenced by a particular
//         `Segfit` are logically owned by it and have no interior
//         mutability, so these follow from `S`'s own thread safety.
unsafe impl<S: Send, const BUCKETS: usize> Send for Segfit<S, BUCKETS> {}
unsafe impl<S: Sync, const BUCKETS: usize> Sync for Segfit<S, BUCKETS> {}

/// Returned by [`Segfit::init`] when the region source is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitError;

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("region source exhausted while bootstrapping the heap")
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for InitError {}

impl<S: Init, const BUCKETS: usize> Init for Segfit<S, BUCKETS> {
    const INIT: Self = Self::new(S::INIT);
}

impl<S: const_default1::ConstDefault, const BUCKETS: usize> const_default1::ConstDefault
    for Segfit<S, BUCKETS>
{
    const DEFAULT: Self = Self::new(S::DEFAULT);
}

impl<S: Default, const BUCKETS: usize> Default for Segfit<S, BUCKETS> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S, const BUCKETS: usize> Segfit<S, BUCKETS> {
    /// Evaluates successfully if the parameters are valid.
    const VALID: () = assert!(
        BUCKETS >= 8,
        "`BUCKETS` must cover at least the minimum block size's size class"
    );

    /// Construct an empty, unbootstrapped heap over `source`.
    ///
    /// The first allocation (or an explicit [`Self::init`]) obtains the
    /// initial region.
    pub const fn new(source: S) -> Self {
        let () = Self::VALID;
        Self {
            buckets: [None; BUCKETS],
            extent: None,
            source,
        }
    }

    /// Map a block size to the index of the bucket whose range contains it:
    /// the position of the size's highest set bit, plus one, clamped to the
    /// top bucket. Used identically for insertion and for search start.
    #[inline]
    fn bucket_of(size: usize) -> usize {
        debug_assert!(size > 0);
        let bits = (usize::BITS - size.leading_zeros()) as usize;
        bits.min(BUCKETS - 1)
    }

    /// Round a requested payload size up to a legal block size: add the
    /// boundary-tag overhead, round up to [`ALIGNMENT`], floor at
    /// [`MIN_BLOCK_SIZE`]. Returns `None` on arithmetic overflow.
    #[inline]
    fn adjust_size(size: usize) -> Option<usize> {
        let asize = size.checked_add(OVERHEAD + (ALIGNMENT - 1))? & !(ALIGNMENT - 1);
        Some(asize.max(MIN_BLOCK_SIZE))
    }
}

impl<S: RegionSource, const BUCKETS: usize> Segfit<S, BUCKETS> {
    /// Reset all allocator state and bootstrap a fresh heap: a padding word,
    /// the prologue sentinel, and the epilogue sentinel over a newly obtained
    /// minimal region.
    ///
    /// Any previously managed region is abandoned (the source cannot shrink).
    pub fn init(&mut self) -> Result<(), InitError> {
        self.buckets = [None; BUCKETS];
        self.extent = None;

        // Safety: `ALIGNMENT * 2` is a multiple of `ALIGNMENT`
        let start = unsafe { self.source.extend(ALIGNMENT * 2) }.ok_or(InitError)?;

        // Safety: the source handed us 4 writable words, aligned to
        //         `ALIGNMENT`
        unsafe {
            let p = start.as_ptr();
            *(p as *mut usize) = 0; // padding so payloads are aligned
            let tag = ALIGNMENT | USED;
            *(p.add(WORD) as *mut usize) = tag; // prologue header
            *(p.add(WORD * 2) as *mut usize) = tag; // prologue footer
            write_epilogue(p.add(WORD * 3));

            self.extent = Some(Extent {
                lo: NonNull::new_unchecked(p.add(WORD)),
                epilogue: Block(NonNull::new_unchecked(p.add(WORD * 3))),
            });
        }
        Ok(())
    }

    /// Attempt to allocate a block with at least `size` bytes of payload,
    /// aligned to [`ALIGNMENT`].
    ///
    /// Returns the payload's starting address, or `None` if `size` is zero
    /// or the region source is exhausted. Exhaustion leaves the heap
    /// untouched; freeing memory and retrying is valid.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if self.extent.is_none() {
            self.init().ok()?;
        }
        let asize = Self::adjust_size(size)?;

        // Safety: every block reachable from the buckets or the extent is
        //         owned by `self`
        unsafe {
            let bp = match self.search(asize) {
                Some(bp) => {
                    self.unlink(bp);
                    bp
                }
                None => self.extend_heap(asize)?,
            };
            self.place(bp, asize);

            #[cfg(debug_assertions)]
            self.check("allocate");

            Some(bp.payload())
        }
    }

    /// Free a previously allocated block, merging it eagerly with any free
    /// physical neighbor. `None` is a safe no-op.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must have been returned by this allocator's
    /// `allocate`, `reallocate`, or `zero_allocate` and not freed since.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let p = match ptr {
            Some(p) => p,
            None => return,
        };
        let bp = Block::from_payload(p);
        debug_assert!(bp.is_used());
        bp.set_used(false);
        self.coalesce(bp);

        #[cfg(debug_assertions)]
        self.check("free");
    }

    /// Resize a previously allocated block.
    ///
    /// `size == 0` behaves as [`Self::free`] and returns `None`; a `None`
    /// pointer behaves as [`Self::allocate`]. Shrinking keeps the starting
    /// address and frees the tail. Growing first tries to absorb a free
    /// physical neighbor in place (moving the payload only when growing
    /// backward), and falls back to allocate + copy + free. On failure the
    /// original block is untouched and still valid.
    ///
    /// # Safety
    ///
    /// Same as [`Self::free`].
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            self.free(ptr);
            return None;
        }
        let p = match ptr {
            Some(p) => p,
            None => return self.allocate(size),
        };
        let bp = Block::from_payload(p);
        debug_assert!(bp.is_used());
        let old_size = bp.size();
        let new_size = Self::adjust_size(size)?;

        if new_size <= old_size {
            // Shrink toward the end, keeping the starting address; no copy.
            self.place(bp, new_size);

            #[cfg(debug_assertions)]
            self.check("reallocate");

            return Some(bp.payload());
        }

        let grow_by = new_size - old_size;
        let prev = bp.prev_phys();
        let next = bp.next_phys();
        let next_gain = if next.is_used() { 0 } else { next.size() };
        let prev_gain = if prev.is_used() { 0 } else { prev.size() };

        if next_gain >= grow_by {
            // Grow into the free successor; the payload does not move.
            self.unlink(next);
            bp.stamp(old_size + next_gain, false);
            self.place(bp, new_size);

            #[cfg(debug_assertions)]
            self.check("reallocate");

            return Some(bp.payload());
        }

        if prev_gain != 0 && prev_gain + next_gain >= grow_by {
            // Grow backward into the free predecessor, taking the successor
            // too only when the predecessor alone is not enough. The start
            // address shifts, so the payload ranges can overlap and the
            // bytes must be moved with `ptr::copy`.
            self.unlink(prev);
            let mut merged = old_size + prev_gain;
            if prev_gain < grow_by {
                self.unlink(next);
                merged += next_gain;
            }
            ptr::copy(
                bp.payload().as_ptr(),
                prev.payload().as_ptr(),
                old_size - OVERHEAD,
            );
            prev.stamp(merged, false);
            self.place(prev, new_size);

            #[cfg(debug_assertions)]
            self.check("reallocate");

            return Some(prev.payload());
        }

        // In-place growth is not possible; relocate.
        let new_ptr = self.allocate(size)?;
        ptr::copy_nonoverlapping(p.as_ptr(), new_ptr.as_ptr(), old_size - OVERHEAD);
        self.free(Some(p));
        Some(new_ptr)
    }

    /// Allocate a zero-filled block for `count` elements of `size` bytes
    /// each.
    ///
    /// An overflowing `count * size` is an allocation failure, not a silent
    /// wrap.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        // Safety: `allocate` returned at least `total` writable payload bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Some(ptr)
    }

    /// First-fit search: scan the bucket for the adjusted size, then every
    /// larger bucket, for any free block of at least `asize` bytes.
    unsafe fn search(&self, asize: usize) -> Option<Block> {
        for list in Self::bucket_of(asize)..BUCKETS {
            let mut cur = self.buckets[list];
            while let Some(bp) = cur {
                if bp.size() >= asize {
                    return Some(bp);
                }
                cur = bp.next_free();
            }
        }
        None
    }

    /// Push `bp` onto the head of the bucket for its size.
    unsafe fn link(&mut self, bp: Block) {
        let list = Self::bucket_of(bp.size());
        let head = self.buckets[list].replace(bp);
        bp.set_prev_free(None);
        bp.set_next_free(head);
        if let Some(head) = head {
            head.set_prev_free(Some(bp));
        }
    }

    /// Detach `bp` from its bucket. A linked block's size never changes, so
    /// the bucket computed here always matches the one used at insertion.
    unsafe fn unlink(&mut self, bp: Block) {
        let list = Self::bucket_of(bp.size());
        match (bp.prev_free(), bp.next_free()) {
            // sole member
            (None, None) => self.buckets[list] = None,
            // head of its list
            (None, Some(next)) => {
                next.set_prev_free(None);
                self.buckets[list] = Some(next);
            }
            // tail
            (Some(prev), None) => prev.set_next_free(None),
            // interior
            (Some(prev), Some(next)) => {
                prev.set_next_free(Some(next));
                next.set_prev_free(Some(prev));
            }
        }
    }

    /// Merge `bp` with whichever physical neighbors are free and insert the
    /// result into its bucket. The neighbors are unlinked *before* their
    /// sizes change. Returns the merged block.
    ///
    /// # Safety
    ///
    /// `bp` must be a non-sentinel block tagged free and in no bucket.
    unsafe fn coalesce(&mut self, bp: Block) -> Block {
        let prev = bp.prev_phys();
        let next = bp.next_phys();
        let mut start = bp;
        let mut size = bp.size();

        if !next.is_used() {
            self.unlink(next);
            size += next.size();
        }
        if !prev.is_used() {
            self.unlink(prev);
            size += prev.size();
            start = prev;
        }

        start.stamp(size, false);
        self.link(start);
        start
    }

    /// Carve an `asize`-byte allocated block off the front of `bp`. If the
    /// remainder can stand alone as a block it is freed (and eagerly merged
    /// with a free successor); otherwise the whole of `bp` is used.
    ///
    /// # Safety
    ///
    /// `bp` must be owned by `self`, at least `asize` bytes large, and in no
    /// bucket.
    unsafe fn place(&mut self, bp: Block, asize: usize) {
        let total = bp.size();
        debug_assert!(total >= asize);
        if total - asize >= MIN_BLOCK_SIZE {
            bp.stamp(asize, true);
            let rest = bp.next_phys();
            rest.stamp(total - asize, false);
            self.coalesce(rest);
        } else {
            bp.stamp(total, true);
        }
    }

    /// Grow the heap enough to place an `asize`-byte block: stamp the new
    /// space as one free block over the old epilogue, write a fresh epilogue
    /// at the new end, and merge with a free block that was sitting at the
    /// old end. Returns the resulting free, unlinked block.
    unsafe fn extend_heap(&mut self, asize: usize) -> Option<Block> {
        let epi = self.extent.as_ref()?.epilogue;

        // Whatever free space already sits at the end of the heap reduces
        // how much we need to grow. `search` has already failed, so any such
        // block is smaller than `asize`.
        let tail = epi.prev_phys();
        let slack = if tail.is_used() { 0 } else { tail.size() };
        debug_assert!(slack < asize);
        let grow = (asize - slack).max(MIN_EXTEND);

        let new = self.source.extend(grow)?;
        debug_assert_eq!(new.as_ptr(), epi.addr().add(WORD));

        // The old epilogue header becomes the new block's header.
        let bp = Block(epi.0);
        bp.stamp(grow, false);
        let new_epi = bp.next_phys();
        write_epilogue(new_epi.addr());
        self.extent.as_mut()?.epilogue = new_epi;

        if slack != 0 {
            self.unlink(tail);
            tail.stamp(slack + grow, false);
            return Some(tail);
        }
        Some(bp)
    }
}

//! The heap consistency checker: a pure validation pass over the block
//! stream and the free-list buckets, and the fatal-on-corruption policy
//! wrapper on top of it.
use core::fmt;

use super::{
    block::{Block, ALIGNMENT, MIN_BLOCK_SIZE, SIZE_MASK, USED, WORD},
    Segfit,
};

/// The set of structural violations found by [`Segfit::verify`].
///
/// An empty set means the heap passed every check. A non-empty set means the
/// heap can no longer be trusted to service calls; [`Segfit::check`] treats
/// it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Violations {
    bits: u16,
}

macro_rules! violations {
    ($($(#[$attr:meta])* $name:ident = $bit:expr, $desc:expr;)*) => {
        impl Violations {
            $(
                $(#[$attr])*
                pub const $name: Self = Self { bits: 1 << $bit };
            )*

            fn descriptions(self) -> impl Iterator<Item = &'static str> {
                [$((Self::$name, $desc)),*]
                    .into_iter()
                    .filter(move |(flag, _)| self.contains(*flag))
                    .map(|(_, desc)| desc)
            }
        }
    };
}

violations! {
    /// A block's size is zero, below the minimum, or not a multiple of the
    /// alignment unit.
    MISALIGNED_SIZE = 0, "illegal or misaligned block size";
    /// More than one block in the same bucket has no back link.
    MULTIPLE_HEADS = 1, "more than one list head in a bucket";
    /// More than one block in the same bucket has no forward link.
    MULTIPLE_TAILS = 2, "more than one list tail in a bucket";
    /// A forward/back link pair disagrees.
    LINK_MISMATCH = 3, "free-list links don't match up";
    /// A block's header and footer tags differ.
    TAG_MISMATCH = 4, "header/footer tag mismatch";
    /// A block extends outside the tracked heap bounds.
    OUT_OF_BOUNDS = 5, "block outside of heap bounds";
    /// A block's payload address fails the required alignment.
    MISALIGNED_BLOCK = 6, "block start not aligned to the alignment unit";
    /// Two physically adjacent blocks are both free.
    UNCOALESCED = 7, "two adjacent free blocks (coalescing failure)";
    /// The prologue sentinel is the wrong size or not allocated.
    BAD_PROLOGUE = 8, "malformed prologue sentinel";
    /// The epilogue sentinel is not a zero-sized allocated header.
    BAD_EPILOGUE = 9, "malformed epilogue sentinel";
    /// A bucket entry is not a free block of that bucket's size class, or
    /// the bucket membership count disagrees with the heap scan.
    BAD_LIST_ENTRY = 10, "free-list membership error";
}

impl Violations {
    /// The empty set.
    pub const NONE: Self = Self { bits: 0 };

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    #[inline]
    pub(crate) fn insert(&mut self, other: Self) {
        self.bits |= other.bits;
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no violations");
        }
        let mut first = true;
        for desc in self.descriptions() {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            f.write_str(desc)?;
        }
        Ok(())
    }
}

impl<S, const BUCKETS: usize> Segfit<S, BUCKETS> {
    /// Validate the heap, accumulating every violation found rather than
    /// stopping at the first.
    ///
    /// One forward scan walks the block stream from the prologue to the
    /// epilogue checking tags, alignment, bounds, and the eager-coalescing
    /// invariant; a second pass walks every bucket checking that each entry
    /// is a free block filed under its own size class and that membership
    /// agrees with the heap scan. A heap that has not been bootstrapped yet
    /// is trivially consistent.
    ///
    /// This function only reads; termination on corruption is
    /// [`Segfit::check`]'s policy, not part of validation.
    pub fn verify(&self) -> Violations {
        let mut v = Violations::NONE;
        let extent = match &self.extent {
            Some(extent) => extent,
            None => return v,
        };
        let epi = extent.epilogue;
        let lo = extent.lo.as_ptr();

        // Safety: the region between `lo` and the epilogue is owned by
        //         `self`; every read below is bounds-checked against it
        //         before being trusted
        unsafe {
            let pro = Block(extent.lo);
            if pro.size() != ALIGNMENT || !pro.is_used() || pro.header() != pro.footer() {
                v.insert(Violations::BAD_PROLOGUE);
            }
            if epi.header() != USED {
                v.insert(Violations::BAD_EPILOGUE);
            }

            let mut n_free = 0usize;
            let mut heads = [0usize; BUCKETS];
            let mut tails = [0usize; BUCKETS];
            let mut prev_was_free = false;

            let mut bp = Block(extent.lo).next_phys();
            while bp.addr() < epi.addr() {
                if bp.payload().as_ptr() as usize % ALIGNMENT != 0 {
                    // An unaligned header word can't be read safely; stop
                    // the scan here.
                    v.insert(Violations::MISALIGNED_BLOCK);
                    break;
                }
                let size = bp.size();
                if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 {
                    // The size can't be trusted, so neither can the footer
                    // location or the next header.
                    v.insert(Violations::MISALIGNED_SIZE);
                    break;
                }
                match (bp.addr() as usize).checked_add(size) {
                    Some(end) if end <= epi.addr() as usize => {}
                    _ => {
                        v.insert(Violations::OUT_OF_BOUNDS);
                        break;
                    }
                }
                if bp.header() != bp.footer() {
                    v.insert(Violations::TAG_MISMATCH);
                }

                if bp.is_used() {
                    prev_was_free = false;
                } else {
                    n_free += 1;
                    if prev_was_free {
                        v.insert(Violations::UNCOALESCED);
                    }
                    prev_was_free = true;

                    let list = Self::bucket_of(size);
                    match bp.prev_free() {
                        None => {
                            heads[list] += 1;
                            if heads[list] > 1 {
                                v.insert(Violations::MULTIPLE_HEADS);
                            }
                        }
                        Some(prev) => {
                            if prev.next_free() != Some(bp) {
                                v.insert(Violations::LINK_MISMATCH);
                            }
                        }
                    }
                    match bp.next_free() {
                        None => {
                            tails[list] += 1;
                            if tails[list] > 1 {
                                v.insert(Violations::MULTIPLE_TAILS);
                            }
                        }
                        Some(next) => {
                            if next.prev_free() != Some(bp) {
                                v.insert(Violations::LINK_MISMATCH);
                            }
                        }
                    }
                }

                bp = bp.next_phys();
            }

            // Walk every bucket. Each free block found by the heap scan must
            // be reachable from exactly one bucket, the one matching its
            // size.
            let mut n_listed = 0usize;
            for (list, head) in self.buckets.iter().enumerate() {
                let mut cur = *head;
                let mut steps = 0usize;
                while let Some(bp) = cur {
                    if bp.addr() <= lo
                        || bp.addr() as usize + MIN_BLOCK_SIZE > epi.addr() as usize
                    {
                        // The link escaped the heap; don't follow it.
                        v.insert(Violations::OUT_OF_BOUNDS);
                        break;
                    }
                    if (bp.addr() as usize + WORD) % ALIGNMENT != 0 {
                        // The link can't be read safely; don't follow it.
                        v.insert(Violations::MISALIGNED_BLOCK);
                        break;
                    }
                    if steps >= n_free {
                        // More entries than free blocks exist: a cycle or a
                        // cross-linked list.
                        v.insert(Violations::LINK_MISMATCH);
                        break;
                    }
                    steps += 1;
                    n_listed += 1;
                    let size = bp.header() & SIZE_MASK;
                    if bp.is_used() || size == 0 || Self::bucket_of(size) != list {
                        v.insert(Violations::BAD_LIST_ENTRY);
                    }
                    cur = bp.next_free();
                }
            }
            if n_listed != n_free {
                v.insert(Violations::BAD_LIST_ENTRY);
            }
        }

        v
    }

    /// Run [`Self::verify`] and panic with the full violation report if the
    /// heap is inconsistent. `origin` names the call site for the report.
    ///
    /// An inconsistent heap cannot safely service further calls, so the
    /// failure is fatal by policy; when the heap is consistent this returns
    /// silently.
    #[track_caller]
    pub fn check(&self, origin: &str) {
        let violations = self.verify();
        if !violations.is_empty() {
            panic!("heap consistency check failed at `{origin}`: {violations}");
        }
    }
}

//! Tunable constants named throughout `spec.md`.

/// §3.3 — short strings are interned; longer ones are not. The spec's open
/// question says a length exactly equal to the bound counts as short.
pub const SHORT_STRING_BOUND: usize = 40;

/// §4.11 — bound on `__index`/`__newindex` chain length before the VM
/// declares a loop and raises, rather than walking forever.
pub const MAXTAGLOOP: usize = 2000;

/// §4.10 — `setlist` flush batch size.
pub const LFIELDS_PER_FLUSH: usize = 50;

/// §4.1 — vector growth policy minimum first capacity.
pub const MINSIZEARRAY: usize = 4;

/// Upper bound on live call frames per thread; exceeding this raises a
/// stack-overflow runtime error rather than overflowing the host stack
/// (tail calls never grow this, per the tail-call economy invariant).
pub const MAX_CALL_FRAMES: usize = 200;

/// Upper bound on the value stack of a single thread.
pub const MAX_STACK: usize = 1_000_000;

/// §4.6 — default GC pause (percentage of heap growth that triggers a
/// new cycle) and step multiplier.
pub const DEFAULT_GC_PAUSE: i32 = 200;
pub const DEFAULT_GC_STEP_MULTIPLIER: i32 = 200;
pub const DEFAULT_GC_STEP_SIZE_KB: i32 = 13;

/// §4.3 — literal cache is two-way set-associative, default 53 buckets.
pub const LITERAL_CACHE_BUCKETS: usize = 53;
pub const LITERAL_CACHE_WAYS: usize = 2;

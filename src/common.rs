pub(crate) mod error;
pub(crate) mod key_lock;
pub(crate) mod time;

pub(crate) fn num_cpus() -> usize {
    use std::{num::NonZeroUsize, thread::available_parallelism};
    available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

use std::ops::Range;

use rand::Rng;

/// Source of randomness for gossip partner and column selection. Each engine
///  instance owns its source, so tests can script the choices deterministically.
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send {
    fn gen_usize_range(&mut self, range: Range<usize>) -> usize;
}

pub struct ThreadRngRandom;

impl Random for ThreadRngRandom {
    fn gen_usize_range(&mut self, range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }
}

use std::collections::VecDeque;
use std::ops::Range;

use crate::util::random::Random;

/// A [Random] that plays back a fixed script of picks. Values are clamped
///  into the requested range; an exhausted script keeps answering with the
///  range start.
pub struct ScriptedRandom {
    script: VecDeque<usize>,
}

impl ScriptedRandom {
    pub fn new(script: Vec<usize>) -> ScriptedRandom {
        ScriptedRandom { script: script.into() }
    }
}

impl Random for ScriptedRandom {
    fn gen_usize_range(&mut self, range: Range<usize>) -> usize {
        match self.script.pop_front() {
            Some(v) => range.start + v % (range.end - range.start),
            None => range.start,
        }
    }
}

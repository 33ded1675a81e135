use std::collections::VecDeque;

use super::{FrameSource, SourceRead};
use crate::frame::Frame;

/// Replays a fixed list of reads, then `Eof`. Frames keep the timing they were
/// built with, which makes pipeline runs reproducible.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    reads: VecDeque<SourceRead>,
    closed: bool,
}

impl ScriptedSource {
    pub fn new(reads: impl IntoIterator<Item = SourceRead>) -> Self {
        Self {
            reads: reads.into_iter().collect(),
            closed: false,
        }
    }

    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self::new(frames.into_iter().map(SourceRead::Frame))
    }

    pub fn remaining(&self) -> usize {
        self.reads.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn read(&mut self) -> SourceRead {
        self.reads.pop_front().unwrap_or(SourceRead::Eof)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

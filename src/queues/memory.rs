//! In-process [`TaskQueue`].

use std::{collections::VecDeque, sync::Mutex};

use super::{Lane, Task, TaskQueue, decode_task, encode_task};
use crate::prelude::*;

/// A [`TaskQueue`] for a single process. Tasks are stored serialized, just
/// like in a shared queue, so anything that runs here also survives the
/// trip through Redis.
#[derive(Default)]
pub struct MemoryTaskQueue {
    lanes: Mutex<[VecDeque<String>; 3]>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn push(&self, lane: Lane, task: &Task) -> Result<()> {
        let raw = encode_task(task)?;
        let mut lanes = self.lanes.lock().expect("lock poisoned");
        lanes[lane.index()].push_back(raw);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<(Lane, Task)>> {
        let popped = {
            let mut lanes = self.lanes.lock().expect("lock poisoned");
            Lane::BY_PRIORITY
                .iter()
                .find_map(|&lane| lanes[lane.index()].pop_front().map(|raw| (lane, raw)))
        };
        match popped {
            Some((lane, raw)) => Ok(Some((lane, decode_task(lane, &raw)?))),
            None => Ok(None),
        }
    }

    async fn pending_count(&self) -> Result<usize> {
        let lanes = self.lanes.lock().expect("lock poisoned");
        Ok(lanes.iter().map(VecDeque::len).sum())
    }
}

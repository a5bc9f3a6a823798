//! A pure in-memory engine: a `BTreeMap` holding keys and values directly,
//! no persistence at all. Used for `Backend::open_in_memory` and as the
//! fast substrate for the conformance suite.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::engine::{Engine, EngineSnapshot, Op, Status};
use crate::error::{CResult, Error};

#[derive(Default)]
pub struct MemoryEngine {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Engine for MemoryEngine {
    type Snapshot = MemorySnapshot;

    fn get(&mut self, key: &[u8]) -> CResult<Vec<u8>> {
        self.data.get(key).cloned().ok_or(Error::NotFound)
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.data.remove(key);
        Ok(())
    }

    fn apply_batch(&mut self, ops: &[Op]) -> CResult<()> {
        for op in ops {
            match op {
                Op::Put(k, v) => {
                    self.data.insert(k.clone(), v.clone());
                }
                Op::Delete(k) => {
                    self.data.remove(k);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Self::Snapshot {
        MemorySnapshot { data: Arc::new(self.data.clone()) }
    }

    fn status(&mut self) -> CResult<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().fold(0, |acc, (k, v)| acc + k.len() as u64 + v.len() as u64),
            total_disk_size: 0,
            live_disk_size: 0,
            garbage_disk_size: 0,
        })
    }

    fn compact(&mut self) -> CResult<()> {
        Ok(())
    }

    fn location(&self) -> &str {
        ""
    }
}

#[derive(Clone)]
pub struct MemorySnapshot {
    data: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl EngineSnapshot for MemorySnapshot {
    fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.data.get(key).cloned().ok_or(Error::NotFound)
    }

    fn range<'a>(
        &'a self,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
    ) -> Box<dyn DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> + 'a> {
        Box::new(self.data.range((start, end)).map(|(k, v)| Ok((k.clone(), v.clone()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::engine::conformance::test_engine!(MemoryEngine::new());
}

//! Translation of GPU addresses found in command streams back to host memory.

use super::memory::memqueue::MemQueue;
use super::memory::{MemDesc, Resolved};
use super::process::ProcessList;
use crate::error::{KgslError, KgslResult};

/// Smallest unit the command-stream parser ever asks about.
const LOOKUP_SIZE: usize = std::mem::size_of::<u32>();

/// The places a GPU address can point into, searched in a fixed order.
#[derive(Debug)]
pub struct AddressResolver<'a> {
    /// Device-global regions: ring buffer, ring pointers, memory store.
    pub globals: &'a [MemDesc],
    pub processes: &'a ProcessList,
    pub memqueue: &'a MemQueue,
}

impl AddressResolver<'_> {
    /// Finds the host pointer behind `gpuaddr`.
    ///
    /// With a `pt_base` hint only the process whose pagetable lives at that base is searched.
    /// Entries waiting in the free queue still resolve: the GPU may be reading them.
    pub fn resolve(&self, pt_base: Option<u32>, gpuaddr: u32) -> KgslResult<Resolved> {
        self.globals
            .iter()
            .find_map(|desc| desc.translate(gpuaddr))
            .or_else(|| {
                self.processes.find_map(|process| {
                    if pt_base.is_some_and(|base| base != process.pagetable().base) {
                        return None;
                    }
                    process.resolve(gpuaddr, LOOKUP_SIZE)
                })
            })
            .or_else(|| {
                self.memqueue
                    .find(gpuaddr)
                    .and_then(|desc| desc.translate(gpuaddr))
            })
            .ok_or_else(|| KgslError::NotFound(format!("gpuaddr {gpuaddr:#x} is not mapped")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::BackingSource;
    use crate::driver::memory::registry::MapRequest;
    use crate::driver::testing::TestMem;
    use crate::kgsl::timestamp::{Timestamp, TimestampType};

    fn ringbuffer() -> MemDesc {
        MemDesc {
            gpuaddr: 0x0010_0000,
            size: 0x1000,
            hostptr: 0x7000_0000 as *mut u8,
            pagetable: None,
        }
    }

    #[test]
    fn globals_win_and_misses_are_not_found() {
        let t = TestMem::new();
        let list = ProcessList::new();
        let q = MemQueue::new();
        let globals = [ringbuffer()];
        let r = AddressResolver {
            globals: &globals,
            processes: &list,
            memqueue: &q,
        };

        let hit = r.resolve(None, 0x0010_0010).unwrap();
        assert_eq!(hit.hostptr as usize, 0x7000_0010);
        assert_eq!(hit.remaining, 0xFF0);
        assert!(matches!(r.resolve(None, 0x0020_0000), Err(KgslError::NotFound(_))));
        drop(t);
    }

    #[test]
    fn hint_filters_processes_and_queue_still_resolves() {
        let t = TestMem::new();
        let list = ProcessList::new();
        let p = list.get(20, 20, &t.mem).unwrap();
        let desc = p
            .map(&MapRequest::new(BackingSource::Pinned { fd: 8192 }))
            .unwrap();
        let mut q = MemQueue::new();

        {
            let r = AddressResolver {
                globals: &[],
                processes: &list,
                memqueue: &q,
            };
            let base = p.pagetable().base;
            let hit = r.resolve(Some(base), desc.gpuaddr + 0x1004).unwrap();
            assert_eq!(hit.remaining, 8192 - 0x1004);
            assert!(r.resolve(Some(base + 1), desc.gpuaddr).is_err());
        }

        let entry = p.release(desc.gpuaddr).unwrap();
        q.enqueue(entry, Timestamp(5), TimestampType::Retired)
            .unwrap();
        let r = AddressResolver {
            globals: &[],
            processes: &list,
            memqueue: &q,
        };
        assert!(r.resolve(None, desc.gpuaddr).is_ok());

        q.drain(Timestamp(5), &t.mem);
        let r = AddressResolver {
            globals: &[],
            processes: &list,
            memqueue: &q,
        };
        assert!(matches!(r.resolve(None, desc.gpuaddr), Err(KgslError::NotFound(_))));
        drop(list.put(p));
    }
}

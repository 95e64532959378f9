use crate::boot::layout::DEFAULT_MAX_MEM;
use crate::boot::paging::VirtualRemapping;

/// Construction-time configuration of a [`Machine`](super::Machine).
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Size of guest main memory in bytes.
    pub max_mem: u64,
    /// Working memory a fork may materialize, in bytes. Zero is unlimited.
    pub max_cow_mem: u64,
    /// Pages at or above this address stay writable and shared across
    /// forks. Zero means no shared area.
    pub shared_memory_boundary: u64,
    /// Extra virtual-to-physical mappings added to the page tables.
    pub remappings: Vec<VirtualRemapping>,
    /// Map the heap with 4KB pages only.
    pub split_hugepages: bool,
    /// Initial stack pointer. Defaults to the top of main memory.
    pub stack_address: Option<u64>,
    /// Log page tables and the exception table at lifecycle points.
    pub verbose: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            max_mem: DEFAULT_MAX_MEM,
            max_cow_mem: 0,
            shared_memory_boundary: 0,
            remappings: Vec::new(),
            split_hugepages: false,
            stack_address: None,
            verbose: false,
        }
    }
}

use crate::mem::address_space::AddressSpace;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

pub type Pid = u16;
pub type AtomicPid = AtomicU16;

/// Every live address space, by owning process.
pub struct ProcessTable {
    content: BTreeMap<Pid, Arc<AddressSpace>>,
    next_pid: AtomicPid,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self {
            content: BTreeMap::new(),
            next_pid: AtomicPid::new(1),
        }
    }
}

impl ProcessTable {
    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }

    pub fn add(&mut self, space: Arc<AddressSpace>) {
        let pid = space.pid();
        assert!(
            !self.content.contains_key(&pid),
            "address space for pid {pid} already added to process table."
        );
        self.content.insert(pid, space);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.content.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.content.get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

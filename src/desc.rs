//! Descriptor pool
//!
//! Descriptors are created once, each with a fixed cookie equal to its
//! index in the arena. Only their buffers cycle. The free stack and its
//! per-descriptor membership flags are the one piece of shared state and
//! sit behind a mutex so the drop path can pop from it while the pool is
//! otherwise borrowed.

use log::{debug, warn};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::buffer::StatusBuffer;
use crate::hw::DmaOps;
use crate::{Result, RxMonError};

/// Ring descriptor
#[derive(Debug)]
pub struct Descriptor {
    cookie: u32,
    buffer: Option<StatusBuffer>,
}

impl Descriptor {
    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn buffer(&self) -> Option<&StatusBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut StatusBuffer> {
        self.buffer.as_mut()
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }
}

/// Free cookies plus an `in_free` flag per descriptor
#[derive(Debug, Default)]
struct FreeList {
    stack: Vec<u32>,
    in_free: Vec<bool>,
}

#[derive(Debug)]
pub struct DescriptorPool {
    descs: Vec<Descriptor>,
    free: Mutex<FreeList>,
}

impl DescriptorPool {
    pub fn new(num_entries: usize) -> Self {
        let descs = (0..num_entries as u32)
            .map(|cookie| Descriptor {
                cookie,
                buffer: None,
            })
            .collect();
        // Lowest cookie on top of the stack.
        let free = FreeList {
            stack: (0..num_entries as u32).rev().collect(),
            in_free: vec![true; num_entries],
        };
        Self {
            descs,
            free: Mutex::new(free),
        }
    }

    fn free_list(&self) -> MutexGuard<'_, FreeList> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop up to `n` free cookies; fewer when the pool runs dry.
    pub fn allocate(&self, n: usize) -> Vec<u32> {
        let mut free = self.free_list();
        let take = n.min(free.stack.len());
        let at = free.stack.len() - take;
        let mut cookies = free.stack.split_off(at);
        cookies.reverse();
        for &cookie in &cookies {
            free.in_free[cookie as usize] = false;
        }
        if take < n {
            debug!("descriptor pool short: wanted {}, got {}", n, take);
        }
        cookies
    }

    /// Return cookies to the free stack. Unknown or already-free cookies
    /// are ignored.
    pub fn release(&self, cookies: &[u32]) {
        let mut free = self.free_list();
        for &cookie in cookies {
            if cookie as usize >= self.descs.len() {
                warn!("release of unknown descriptor cookie {}", cookie);
                continue;
            }
            if free.in_free[cookie as usize] {
                warn!("descriptor cookie {} released twice", cookie);
                continue;
            }
            free.in_free[cookie as usize] = true;
            free.stack.push(cookie);
        }
    }

    pub fn is_free(&self, cookie: u32) -> bool {
        self.free_list()
            .in_free
            .get(cookie as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn free_count(&self) -> usize {
        self.free_list().stack.len()
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn get(&self, cookie: u32) -> Option<&Descriptor> {
        self.descs.get(cookie as usize)
    }

    pub fn get_mut(&mut self, cookie: u32) -> Option<&mut Descriptor> {
        self.descs.get_mut(cookie as usize)
    }

    /// Hang a buffer off a descriptor.
    pub fn attach(&mut self, cookie: u32, buffer: StatusBuffer) -> Result<()> {
        let desc = self.get_mut(cookie).ok_or_else(|| {
            RxMonError::InvalidParameter(format!("descriptor cookie {} out of range", cookie))
        })?;
        if desc.buffer.is_some() {
            return Err(RxMonError::InvalidParameter(format!(
                "descriptor {} already holds a buffer",
                cookie
            )));
        }
        desc.buffer = Some(buffer);
        Ok(())
    }

    pub fn detach(&mut self, cookie: u32) -> Option<StatusBuffer> {
        self.get_mut(cookie)?.buffer.take()
    }

    /// Unmap and drop every attached buffer. Returns how many were freed.
    pub fn free_buffers(&mut self, dma: &mut dyn DmaOps) -> usize {
        let mut freed = 0;
        for desc in self.descs.iter_mut() {
            if let Some(mut buf) = desc.buffer.take() {
                dma.unmap(&mut buf);
                freed += 1;
            }
        }
        debug!("descriptor pool freed {} buffers", freed);
        freed
    }

    /// Destroy the descriptors themselves.
    pub fn clear(&mut self) {
        self.descs.clear();
        let mut free = self.free_list();
        free.stack.clear();
        free.in_free.clear();
    }
}

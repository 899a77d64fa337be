//! USB request blocks: one queued transfer on an endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{Error, Result};

bitflags! {
    pub(crate) struct UrbFlags: u8 {
        /// The transfer ends with this URB; IN transfers of a whole number of packets get a ZLP.
        const END = 1 << 0;
        /// Taken from the shared pool rather than the endpoint's own URB.
        const EXTRA = 1 << 1;
        /// A trailing zero-length packet is still owed.
        const ZLP = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum UrbState {
    Sync,
    Async,
}

/// What an asynchronous transfer reports back to its submitter.
#[derive(Debug)]
pub struct Completion {
    pub ep_addr: u8,
    /// The submitted buffer. For OUT endpoints the first `xfer_len` bytes hold the data.
    pub buf: Vec<u8>,
    pub requested: usize,
    pub xfer_len: usize,
    pub result: Result<()>,
}

pub type AsyncCallback = Box<dyn FnOnce(Completion) + Send>;

pub(crate) struct Urb {
    pub id: u64,
    pub flags: UrbFlags,
    pub state: UrbState,
    /// Only asynchronous URBs own their buffer; synchronous callers keep theirs on the stack.
    pub buf: Vec<u8>,
    pub buf_len: usize,
    pub xfer_len: usize,
    pub next_xfer_len: usize,
    pub callback: Option<AsyncCallback>,
    /// Set by the completion path when the controller reports an error.
    pub result: Option<Error>,
}

impl Urb {
    /// Hands the URB to its callback, if it has one.
    pub fn complete(self, ep_addr: u8, result: Result<()>) -> Option<(AsyncCallback, Completion)> {
        let callback = self.callback?;
        Some((
            callback,
            Completion {
                ep_addr,
                buf: self.buf,
                requested: self.buf_len,
                xfer_len: self.xfer_len,
                result,
            },
        ))
    }
}

/// Every open endpoint owns one URB (`main_busy` in its state); the pool only tracks the shared
/// extras and hands out ids.
pub(crate) struct UrbPool {
    extra_free: Mutex<usize>,
    next_id: AtomicU64,
}

impl UrbPool {
    pub fn new(extra: usize) -> Self {
        Self {
            extra_free: Mutex::new(extra),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get(&self, main_busy: &mut bool, state: UrbState, buf: Vec<u8>, buf_len: usize) -> Result<Urb> {
        let mut flags = UrbFlags::empty();
        if *main_busy {
            let mut free = self.extra_free.lock().unwrap();
            if *free == 0 {
                return Err(Error::Full);
            }
            *free -= 1;
            flags |= UrbFlags::EXTRA;
        } else {
            *main_busy = true;
        }

        Ok(Urb {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            flags,
            state,
            buf,
            buf_len,
            xfer_len: 0,
            next_xfer_len: 0,
            callback: None,
            result: None,
        })
    }

    pub fn put(&self, urb: &Urb, main_busy: &mut bool) {
        if urb.flags.contains(UrbFlags::EXTRA) {
            *self.extra_free.lock().unwrap() += 1;
        } else {
            *main_busy = false;
        }
    }

    pub fn extra_available(&self) -> usize {
        *self.extra_free.lock().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn main_then_extra() {
        let pool = UrbPool::new(1);
        let mut busy = false;
        let a = pool.get(&mut busy, UrbState::Async, Vec::new(), 0).unwrap();
        assert!(busy && !a.flags.contains(UrbFlags::EXTRA));
        let b = pool.get(&mut busy, UrbState::Async, Vec::new(), 0).unwrap();
        assert!(b.flags.contains(UrbFlags::EXTRA));
        assert_eq!(pool.get(&mut busy, UrbState::Async, Vec::new(), 0).err(), Some(Error::Full));
        assert!(b.id > a.id);

        pool.put(&b, &mut busy);
        pool.put(&a, &mut busy);
        assert!(!busy);
        assert_eq!(pool.extra_available(), 1);
    }
}

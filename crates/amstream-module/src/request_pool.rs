//! `RequestPool` — slab of completion-tracking records.
//!
//! Every asynchronous operation handed to a transport is tracked by one
//! `Request`. Records live in a slab addressed by `RequestId` (index plus
//! generation); freed slots go on a LIFO free stack for cache-friendly
//! reuse, so allocation and release are O(1) with no list links inside the
//! record.
//!
//! Lifecycle hooks:
//! - [`Request::init`] builds a zeroed record the first time a slot is used.
//! - [`Request::reset`] runs whenever a record goes back to the pool; after
//!   it the record is indistinguishable from a fresh one.
//! - [`Request::release`] is the final teardown hook.
//!
//! The pool is owned by one progress engine and only touched from its
//! thread; it has no internal locking.

use amstream_core::request::{ConnId, RequestId, Status};
use thiserror::Error;

/// The slab has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request pool exhausted: {capacity} requests in flight")]
pub struct PoolExhausted {
    pub capacity: usize,
}

/// One in-flight transport operation.
///
/// `C` is the engine's completion callback type.
#[derive(Debug)]
pub struct Request<C> {
    pub callback: Option<C>,
    pub status: Status,
    pub completed: bool,
    pub conn_id: ConnId,
    pub recv_length: usize,
    generation: u32,
    in_use: bool,
}

impl<C> Request<C> {
    /// Zero-initialize a record.
    pub fn init() -> Self {
        Self {
            callback: None,
            status: Status::Ok,
            completed: false,
            conn_id: ConnId::NONE,
            recv_length: 0,
            generation: 0,
            in_use: false,
        }
    }

    /// Clear every user-visible field before reuse.
    ///
    /// The slot generation is pool bookkeeping and survives.
    pub fn reset(&mut self) {
        self.callback = None;
        self.status = Status::Ok;
        self.completed = false;
        self.conn_id = ConnId::NONE;
        self.recv_length = 0;
    }

    /// Final teardown: no callback may survive.
    pub fn release(&mut self) {
        self.reset();
        self.in_use = false;
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

/// Fixed-capacity slab of requests.
pub struct RequestPool<C> {
    slots: Vec<Request<C>>,
    /// LIFO stack of free slot indices (for reuse).
    free: Vec<u32>,
    capacity: usize,
    in_use: usize,
}

impl<C> RequestPool<C> {
    /// Create a pool that never holds more than `capacity` requests.
    ///
    /// Slots are created on first use; the backing storage is reserved up
    /// front so the slab never reallocates.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize);
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            capacity,
            in_use: 0,
        }
    }

    /// Allocate a record for `conn_id` carrying `callback`.
    pub fn alloc(&mut self, conn_id: ConnId, callback: C) -> Result<RequestId, PoolExhausted> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.capacity {
                    return Err(PoolExhausted { capacity: self.capacity });
                }
                self.slots.push(Request::init());
                (self.slots.len() - 1) as u32
            }
        };

        let req = &mut self.slots[index as usize];
        debug_assert!(!req.in_use, "free slot {} still in use", index);
        req.in_use = true;
        req.conn_id = conn_id;
        req.callback = Some(callback);
        self.in_use += 1;
        Ok(RequestId::new(index, req.generation))
    }

    /// Resolve a live request. Stale or freed ids resolve to `None`.
    pub fn get(&self, id: RequestId) -> Option<&Request<C>> {
        self.slots
            .get(id.index() as usize)
            .filter(|r| r.in_use && r.generation == id.generation())
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request<C>> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|r| r.in_use && r.generation == id.generation())
    }

    /// Record completion. Returns the record so the caller can take its
    /// callback, or `None` if the id is stale.
    pub fn complete(&mut self, id: RequestId, status: Status, recv_length: usize) -> Option<&mut Request<C>> {
        let req = self.get_mut(id)?;
        req.completed = true;
        req.status = status;
        req.recv_length = recv_length;
        Some(req)
    }

    /// Return a record to the pool. Returns `false` for stale ids.
    pub fn free(&mut self, id: RequestId) -> bool {
        let Some(req) = self.get_mut(id) else {
            return false;
        };
        req.release();
        req.generation = req.generation.wrapping_add(1);
        self.free.push(id.index());
        self.in_use -= 1;
        true
    }

    /// Release every live record (engine teardown). Returns how many were
    /// still in use.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for (index, req) in self.slots.iter_mut().enumerate() {
            if req.in_use {
                req.release();
                req.generation = req.generation.wrapping_add(1);
                self.free.push(index as u32);
                released += 1;
            }
        }
        self.in_use = 0;
        released
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_sequential() {
        let mut pool: RequestPool<u8> = RequestPool::with_capacity(8);
        let a = pool.alloc(ConnId::new(1), 1).unwrap();
        let b = pool.alloc(ConnId::new(1), 2).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.get(b).unwrap().callback, Some(2));
    }

    #[test]
    fn test_free_reuse_lifo_and_stale() {
        let mut pool: RequestPool<u8> = RequestPool::with_capacity(8);
        let a = pool.alloc(ConnId::new(1), 1).unwrap();
        let _b = pool.alloc(ConnId::new(1), 2).unwrap();

        assert!(pool.free(a));
        assert!(!pool.free(a), "double free must be rejected");

        let c = pool.alloc(ConnId::new(2), 3).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert!(pool.get(a).is_none(), "stale id must not resolve");
        assert_eq!(pool.get(c).unwrap().conn_id, ConnId::new(2));
    }

    #[test]
    fn test_reset_matches_fresh() {
        let mut pool: RequestPool<u8> = RequestPool::with_capacity(2);
        let id = pool.alloc(ConnId::new(9), 7).unwrap();
        pool.complete(id, Status::ConnectionReset, 100).unwrap();
        pool.free(id);

        let id = pool.alloc(ConnId::NONE, 0).unwrap();
        let req = pool.get_mut(id).unwrap();
        req.callback = None;
        let fresh: Request<u8> = Request::init();
        assert_eq!(req.callback, fresh.callback);
        assert_eq!(req.status, fresh.status);
        assert_eq!(req.completed, fresh.completed);
        assert_eq!(req.conn_id, fresh.conn_id);
        assert_eq!(req.recv_length, fresh.recv_length);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool: RequestPool<()> = RequestPool::with_capacity(2);
        pool.alloc(ConnId::NONE, ()).unwrap();
        let b = pool.alloc(ConnId::NONE, ()).unwrap();
        assert_eq!(pool.alloc(ConnId::NONE, ()), Err(PoolExhausted { capacity: 2 }));
        pool.free(b);
        assert!(pool.alloc(ConnId::NONE, ()).is_ok());
    }

    #[test]
    fn test_complete_marks_record() {
        let mut pool: RequestPool<u8> = RequestPool::with_capacity(4);
        let id = pool.alloc(ConnId::new(3), 5).unwrap();
        let req = pool.complete(id, Status::Ok, 12).unwrap();
        assert!(req.completed);
        assert_eq!(req.recv_length, 12);
        assert_eq!(req.callback.take(), Some(5));
    }

    #[test]
    fn test_release_all() {
        let mut pool: RequestPool<u8> = RequestPool::with_capacity(4);
        let ids: Vec<_> = (0..3).map(|i| pool.alloc(ConnId::NONE, i).unwrap()).collect();
        pool.free(ids[1]);
        assert_eq!(pool.release_all(), 2);
        assert_eq!(pool.in_use(), 0);
        assert!(ids.iter().all(|&id| pool.get(id).is_none()));
        for _ in 0..4 {
            pool.alloc(ConnId::NONE, 0).unwrap();
        }
    }
}

//! Worker envelope and its reuse pool.
//!
//! A [`Payload`] is what travels to and from a worker: the opaque message body
//! plus a side-channel context. Payloads are taken from a [`PayloadPool`] for
//! the duration of one call and handed back by dropping the returned
//! [`PooledPayload`], which resets them first. A released payload keeps its
//! context allocation but never a reference into a caller's body buffer.

use bytes::Bytes;
use core::ops::{Deref, DerefMut};
use parking_lot::Mutex;

/// Encoding of a payload's context, mirrored in the worker frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadCodec {
    Raw = 0x01,
    #[default]
    Json = 0x02,
    Proto = 0x04,
}

impl PayloadCodec {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PayloadCodec {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Raw),
            0x02 => Ok(Self::Json),
            0x04 => Ok(Self::Proto),
            other => Err(other),
        }
    }
}

/// Request or response exchanged with a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub codec: PayloadCodec,
    pub context: Vec<u8>,
    pub body: Bytes,
}

impl Payload {
    pub fn new(context: impl Into<Vec<u8>>, body: impl Into<Bytes>) -> Self {
        Self {
            codec: PayloadCodec::Json,
            context: context.into(),
            body: body.into(),
        }
    }

    /// Drops the body and clears the context, keeping the context capacity.
    pub fn reset(&mut self) {
        self.body = Bytes::new();
        self.context.clear();
    }
}

/// Concurrency-safe free list of [`Payload`]s.
///
/// At most `capacity` idle payloads are retained; extra ones are dropped on
/// release.
#[derive(Debug)]
pub struct PayloadPool {
    free: Mutex<Vec<Payload>>,
    capacity: usize,
    context_capacity: usize,
}

impl PayloadPool {
    pub const DEFAULT_CONTEXT_CAPACITY: usize = 128;

    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            context_capacity: Self::DEFAULT_CONTEXT_CAPACITY,
        }
    }

    /// Takes an idle payload or allocates a new one. The codec is always reset
    /// to [`PayloadCodec::Json`].
    pub fn acquire(&self) -> PooledPayload<'_> {
        let mut payload = self.free.lock().pop().unwrap_or_else(|| Payload {
            codec: PayloadCodec::Json,
            context: Vec::with_capacity(self.context_capacity),
            body: Bytes::new(),
        });
        payload.codec = PayloadCodec::Json;

        PooledPayload {
            pool: self,
            payload,
        }
    }

    /// Number of idle payloads currently retained.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, mut payload: Payload) {
        payload.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(payload);
        }
    }
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A payload on loan from a [`PayloadPool`]; returned to it on drop.
#[derive(Debug)]
pub struct PooledPayload<'a> {
    pool: &'a PayloadPool,
    payload: Payload,
}

impl Deref for PooledPayload<'_> {
    type Target = Payload;

    fn deref(&self) -> &Self::Target {
        &self.payload
    }
}

impl DerefMut for PooledPayload<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.payload
    }
}

impl Drop for PooledPayload<'_> {
    fn drop(&mut self) {
        let payload = core::mem::take(&mut self.payload);
        self.pool.release(payload);
    }
}

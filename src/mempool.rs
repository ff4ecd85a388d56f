//! Fixed-capacity packet buffer pool.
//!
//! All buffers are carved out of a single page-aligned region at creation
//! time. Free buffers are tracked by index in a bounded MPMC ring, fronted by
//! one cache per lcore so the common alloc/free path touches only lcore-local
//! state. A [`PacketBuffer`] is a move-only handle to one element; dropping
//! it gives the element back to the pool.

#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        error::{Error, Result},
        lcore::{self, MAX_LCORE},
        memory::{page_size, PageAlignedMemory, HUGE_2MB},
        numa::SocketId,
    },
    crossbeam_channel::{Receiver, Sender},
    std::{
        fmt, io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex, PoisonError,
        },
    },
};

/// Headroom reserved in front of the packet data of every buffer.
pub const PKTMBUF_HEADROOM: u16 = 128;

/// Default data room: 2048 bytes of packet data plus headroom.
pub const MBUF_DEFAULT_BUF_SIZE: u16 = 2048 + PKTMBUF_HEADROOM;

/// Largest accepted per-lcore cache.
pub const MEMPOOL_CACHE_MAX_SIZE: usize = 512;

pub struct BufferPool {
    name: String,
    capacity: usize,
    data_room: u16,
    cache_size: usize,
    flush_threshold: usize,
    socket_id: SocketId,
    memory: PageAlignedMemory,
    free_tx: Sender<u32>,
    free_rx: Receiver<u32>,
    caches: Box<[Mutex<Vec<u32>>]>,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Reserve `capacity` buffers of `data_room` bytes each.
    ///
    /// Huge pages are tried first. The pool is never resized.
    pub fn create(
        name: &str,
        capacity: usize,
        cache_size: usize,
        data_room: u16,
        socket_id: SocketId,
    ) -> Result<Arc<Self>> {
        let invalid = |msg: &str| Error::Allocation {
            name: name.to_owned(),
            source: io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned()),
        };

        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(invalid("capacity must be between 1 and u32::MAX"));
        }
        if data_room <= PKTMBUF_HEADROOM {
            return Err(invalid("data room must be larger than the headroom"));
        }
        if cache_size > MEMPOOL_CACHE_MAX_SIZE || cache_size * 3 / 2 > capacity {
            return Err(invalid("cache size too large for pool capacity"));
        }

        let memory = PageAlignedMemory::alloc_with_page_size(
            data_room as usize,
            capacity,
            HUGE_2MB,
            true,
        )
        .or_else(|e| {
            log::warn!("huge page alloc for pool {name} failed ({e}), falling back to regular pages");
            PageAlignedMemory::alloc_with_page_size(data_room as usize, capacity, page_size(), false)
        })
        .map_err(|source| Error::Allocation {
            name: name.to_owned(),
            source,
        })?;

        if let Err(e) = memory.bind_to_socket(socket_id) {
            log::debug!("could not bind pool {name} to numa node {socket_id}: {e}");
        }

        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
        for index in 0..capacity as u32 {
            // cannot fail, the ring holds exactly `capacity` entries
            let _ = free_tx.try_send(index);
        }

        let caches = (0..if cache_size > 0 { MAX_LCORE } else { 0 })
            .map(|_| Mutex::new(Vec::with_capacity(cache_size * 3 / 2 + 1)))
            .collect();

        log::info!(
            "created pool {name}: {capacity} buffers of {data_room} bytes, cache {cache_size}, \
             socket {socket_id}, huge pages: {}",
            memory.is_huge()
        );

        Ok(Arc::new(Self {
            name: name.to_owned(),
            capacity,
            data_room,
            cache_size,
            flush_threshold: (cache_size * 3 / 2).max(1),
            socket_id,
            memory,
            free_tx,
            free_rx,
            caches,
            in_use: AtomicUsize::new(0),
        }))
    }

    /// Take one buffer, or `None` when the pool is exhausted.
    ///
    /// Buffers parked in another lcore's cache are not visible here.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PacketBuffer> {
        let index = self.get()?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(PacketBuffer {
            pool: Arc::clone(self),
            index,
            data_off: PKTMBUF_HEADROOM,
            data_len: 0,
        })
    }

    #[inline]
    fn local_cache(&self) -> Option<&Mutex<Vec<u32>>> {
        lcore::current().and_then(|id| self.caches.get(id.index()))
    }

    fn get(&self) -> Option<u32> {
        let Some(cache) = self.local_cache() else {
            return self.free_rx.try_recv().ok();
        };
        let mut objs = cache.lock().unwrap_or_else(PoisonError::into_inner);
        if objs.is_empty() {
            objs.extend(self.free_rx.try_iter().take(self.cache_size));
        }
        objs.pop()
    }

    fn put(&self, index: u32) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let Some(cache) = self.local_cache() else {
            self.put_ring(index);
            return;
        };
        let mut objs = cache.lock().unwrap_or_else(PoisonError::into_inner);
        objs.push(index);
        if objs.len() >= self.flush_threshold {
            for index in objs.drain(self.cache_size..) {
                self.put_ring(index);
            }
        }
    }

    #[inline]
    fn put_ring(&self, index: u32) {
        if self.free_tx.try_send(index).is_err() {
            log::error!("pool {}: free ring overflow on buffer {index}", self.name);
        }
    }

    /// Buffers currently free, including those parked in lcore caches.
    pub fn available(&self) -> usize {
        self.capacity - self.in_use()
    }

    /// Buffers handed out and not yet returned.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of each element, headroom included.
    pub fn data_room(&self) -> u16 {
        self.data_room
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    #[inline]
    fn element_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.capacity);
        unsafe {
            self.memory
                .as_ptr()
                .add(index as usize * self.data_room as usize)
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("data_room", &self.data_room)
            .field("cache_size", &self.cache_size)
            .field("socket_id", &self.socket_id)
            .finish()
    }
}

/// Exclusive handle to one pool element.
pub struct PacketBuffer {
    pool: Arc<BufferPool>,
    index: u32,
    data_off: u16,
    data_len: u16,
}

impl PacketBuffer {
    /// Element index inside the pool.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data_len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.data_off as usize
    }

    #[inline]
    pub fn tailroom(&self) -> usize {
        self.pool.data_room as usize - self.data_off as usize - self.data_len as usize
    }

    /// Packet bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        // safety: this handle is the only owner of the element
        unsafe {
            std::slice::from_raw_parts(
                self.pool.element_ptr(self.index).add(self.data_off as usize),
                self.data_len as usize,
            )
        }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // safety: this handle is the only owner of the element
        unsafe {
            std::slice::from_raw_parts_mut(
                self.pool.element_ptr(self.index).add(self.data_off as usize),
                self.data_len as usize,
            )
        }
    }

    /// Whole writable area after the headroom, regardless of the current
    /// length. Drivers receive into this and then call [`set_len`].
    ///
    /// [`set_len`]: PacketBuffer::set_len
    #[inline]
    pub fn room_mut(&mut self) -> &mut [u8] {
        let room = self.pool.data_room as usize - self.data_off as usize;
        unsafe {
            std::slice::from_raw_parts_mut(
                self.pool.element_ptr(self.index).add(self.data_off as usize),
                room,
            )
        }
    }

    /// Set the packet length, clamped to the room available.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        let room = self.pool.data_room as usize - self.data_off as usize;
        self.data_len = len.min(room) as u16;
    }

    /// Copy `frame` in, truncating to the room available. Returns the
    /// number of bytes stored.
    pub fn fill_from(&mut self, frame: &[u8]) -> usize {
        let room = self.room_mut();
        let len = frame.len().min(room.len());
        room[..len].copy_from_slice(&frame[..len]);
        self.set_len(len);
        len
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Return the buffer to its pool.
    #[inline]
    pub fn free(self) {
        drop(self)
    }
}

impl Drop for PacketBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.put(self.index);
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("len", &self.data_len)
            .finish()
    }
}

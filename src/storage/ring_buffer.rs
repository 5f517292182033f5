/*! A fixed-capacity byte ring, backing both the send and receive buffers
(`spec.md` §3 "Send buffer"/"Receive buffer", §4.2).

Grounded in the teacher's `storage::RingBuffer` (named, but not bodied, in
the retrieved `src/socket/tcp.rs`: `pub type SocketBuffer<'a> =
RingBuffer<'a, u8>;`), itself `smoltcp`'s ring buffer built on top of
`managed::ManagedSlice` so the backing storage may be either borrowed or
owned — the same flexibility the teacher's `Cargo.toml` already pays for via
its `managed = "0.8.0"` dependency.
*/

use managed::ManagedSlice;

use super::{Empty, Full};

#[derive(Debug)]
pub struct RingBuffer<'a, T: 'a> {
    storage: ManagedSlice<'a, T>,
    read_at: usize,
    length: usize,
}

impl<'a, T: 'a> RingBuffer<'a, T> {
    /// Create a ring buffer backed by the given storage.
    pub fn new<S>(storage: S) -> RingBuffer<'a, T>
    where
        S: Into<ManagedSlice<'a, T>>,
    {
        RingBuffer {
            storage: storage.into(),
            read_at: 0,
            length: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_full(&self) -> bool {
        self.length == self.capacity()
    }

    /// Free space left in the ring.
    pub fn window(&self) -> usize {
        self.capacity() - self.length
    }

    pub fn clear(&mut self) {
        self.read_at = 0;
        self.length = 0;
    }

    fn mask(&self, index: usize) -> usize {
        index % self.capacity().max(1)
    }

    fn write_at(&self) -> usize {
        self.mask(self.read_at + self.length)
    }
}

impl<'a, T: 'a + Copy> RingBuffer<'a, T> {
    /// Append as much of `data` as fits; returns the number of elements
    /// written.
    pub fn enqueue_slice(&mut self, data: &[T]) -> usize {
        let capacity = self.capacity();
        let n = data.len().min(self.window());
        let start = self.write_at();
        for (i, &item) in data[..n].iter().enumerate() {
            self.storage[(start + i) % capacity.max(1)] = item;
        }
        self.length += n;
        n
    }

    pub fn enqueue_one(&mut self, item: T) -> Result<(), Full> {
        if self.is_full() {
            return Err(Full);
        }
        let at = self.write_at();
        self.storage[at] = item;
        self.length += 1;
        Ok(())
    }

    /// Remove up to `data.len()` elements from the front, copying them into
    /// `data`; returns the number of elements copied.
    pub fn dequeue_slice(&mut self, data: &mut [T]) -> usize {
        let n = self.read_allocated(0, data);
        self.read_at = self.mask(self.read_at + n);
        self.length -= n;
        n
    }

    pub fn dequeue_one(&mut self) -> Result<T, Empty> {
        if self.is_empty() {
            return Err(Empty);
        }
        let item = self.storage[self.read_at];
        self.read_at = self.mask(self.read_at + 1);
        self.length -= 1;
        Ok(item)
    }

    /// Copy up to `buf.len()` elements starting `offset` elements past the
    /// read cursor into `buf`, without removing them. Used to materialize
    /// (re)transmit segments from the unacknowledged tail of a send buffer.
    pub fn read_allocated(&self, offset: usize, buf: &mut [T]) -> usize {
        if offset >= self.length {
            return 0;
        }
        let n = buf.len().min(self.length - offset);
        let capacity = self.capacity().max(1);
        let start = self.mask(self.read_at + offset);
        for i in 0..n {
            buf[i] = self.storage[(start + i) % capacity];
        }
        n
    }

    /// Remove `count` elements from the front without copying them out
    /// (used once their bytes have already been acknowledged/delivered).
    pub fn dequeue_allocated(&mut self, count: usize) -> usize {
        let n = count.min(self.length);
        self.read_at = self.mask(self.read_at + n);
        self.length -= n;
        n
    }
}

impl<'a> RingBuffer<'a, u8> {
    /// `capacity − len`, clamped to 16 bits, as advertised in the TCP
    /// window field (before any window-scale shift is applied).
    pub fn advertised_window(&self) -> u16 {
        self.window().min(u16::MAX as usize) as u16
    }
}

impl<'a, T> From<&'a mut [T]> for RingBuffer<'a, T> {
    fn from(slice: &'a mut [T]) -> Self {
        RingBuffer::new(slice)
    }
}

impl<'a, T> From<Vec<T>> for RingBuffer<'a, T> {
    fn from(vec: Vec<T>) -> Self {
        RingBuffer::new(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> RingBuffer<'static, u8> {
        RingBuffer::new(vec![0u8; capacity])
    }

    #[test]
    fn enqueue_respects_capacity() {
        let mut r = ring(4);
        assert_eq!(r.enqueue_slice(&[1, 2, 3, 4, 5]), 4);
        assert!(r.is_full());
    }

    #[test]
    fn dequeue_then_enqueue_wraps_around() {
        let mut r = ring(4);
        r.enqueue_slice(&[1, 2, 3]);
        let mut out = [0u8; 2];
        assert_eq!(r.dequeue_slice(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(r.enqueue_slice(&[4, 5, 6]), 3);
        let mut rest = [0u8; 4];
        assert_eq!(r.dequeue_slice(&mut rest), 4);
        assert_eq!(rest, [3, 4, 5, 6]);
    }

    #[test]
    fn read_allocated_does_not_consume() {
        let mut r = ring(8);
        r.enqueue_slice(&[10, 20, 30, 40]);
        let mut buf = [0u8; 2];
        assert_eq!(r.read_allocated(1, &mut buf), 2);
        assert_eq!(buf, [20, 30]);
        assert_eq!(r.len(), 4); // unchanged
    }

    #[test]
    fn dequeue_allocated_releases_prefix() {
        let mut r = ring(8);
        r.enqueue_slice(&[1, 2, 3, 4]);
        assert_eq!(r.dequeue_allocated(2), 2);
        assert_eq!(r.len(), 2);
        let mut buf = [0u8; 2];
        r.dequeue_slice(&mut buf);
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn advertised_window_matches_free_space() {
        let mut r = ring(100);
        r.enqueue_slice(&[0; 40]);
        assert_eq!(r.advertised_window(), 60);
    }
}

//! A growable, explicitly-capacitied byte buffer.
//!
//! Unlike `Vec<u8>` alone, [`Buffer`] tracks its own capacity
//! independent of whatever the allocator actually handed back, so pool
//! size-class classification (see [`crate::pool::Pool`]) can compare
//! against a deterministic number instead of `Vec::capacity()`, which
//! is free to over-allocate.

const MIN_CAP: usize = 64;

fn round_up_pow2(min: usize) -> usize {
  let mut cap = MIN_CAP;
  while cap < min {
    cap <<= 1;
  }
  cap
}

#[derive(Debug, Default)]
pub struct Buffer {
  data: Vec<u8>,
  cap: usize,
}

impl Buffer {
  pub fn new() -> Self {
    Self { data: Vec::new(), cap: 0 }
  }

  pub fn with_capacity(cap: usize) -> Self {
    let cap = cap.max(MIN_CAP);
    Self { data: Vec::with_capacity(cap), cap }
  }

  pub fn used(&self) -> usize {
    self.data.len()
  }

  pub fn capacity(&self) -> usize {
    self.cap
  }

  pub fn space(&self) -> usize {
    self.cap - self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.data
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.data
  }

  /// Resets `used` to zero; capacity is preserved.
  pub fn clear(&mut self) {
    self.data.clear();
  }

  pub fn truncate(&mut self, n: usize) {
    self.data.truncate(n);
  }

  fn reserve_additional(&mut self, extra: usize) {
    let required = self.data.len() + extra;
    if required > self.cap {
      let new_cap = round_up_pow2(required);
      self.data.reserve(new_cap - self.data.len());
      self.cap = new_cap;
    }
  }

  pub fn append_bytes(&mut self, bytes: &[u8]) {
    self.reserve_additional(bytes.len());
    self.data.extend_from_slice(bytes);
  }

  /// Reserves `n` more bytes and returns a mutable view over the newly
  /// reserved (zero-filled) region, for producers that fill in place.
  pub fn extend(&mut self, n: usize) -> &mut [u8] {
    self.reserve_additional(n);
    let start = self.data.len();
    self.data.resize(start + n, 0);
    &mut self.data[start..]
  }

  /// Moves the allocation out of `src` into `self` in O(1); `src` is
  /// left cleared but keeps whatever allocation `self` used to own.
  pub fn move_from(&mut self, src: &mut Buffer) {
    std::mem::swap(self, src);
    src.clear();
  }

  /// Drops the first `n` bytes in place, shifting the remainder down
  /// to offset zero. Used to reclaim a MEM chunk's leading read offset
  /// without a fresh allocation.
  pub fn drop_prefix(&mut self, n: usize) {
    if n == 0 {
      return;
    }
    self.data.drain(0..n);
  }
}

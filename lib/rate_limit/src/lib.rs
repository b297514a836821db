use std::{
  sync::Mutex,
  time::{Duration, Instant},
};

/// Thread-safe token bucket gating notification delivery.
///
/// Capacity is the configured maximum notifications per hour; tokens
/// refill continuously at capacity / hour. Every delivery attempt
/// consumes one token. When the bucket is empty the caller queues the
/// event for a batched summary instead of dropping it.
pub struct TokenBucket {
  inner: Mutex<Bucket>,
}

impl TokenBucket {
  pub fn per_hour(capacity: u32) -> TokenBucket {
    TokenBucket {
      inner: Mutex::new(Bucket::new(
        capacity,
        Duration::from_secs(60 * 60),
      )),
    }
  }

  /// Consume one token. Returns false when the bucket is empty.
  pub fn try_acquire(&self) -> bool {
    self
      .inner
      .lock()
      .expect("token bucket lock poisoned")
      .try_acquire_at(Instant::now())
  }

  /// Replace capacity on settings reload. Current fill is clamped to
  /// the new capacity.
  pub fn set_capacity_per_hour(&self, capacity: u32) {
    self
      .inner
      .lock()
      .expect("token bucket lock poisoned")
      .set_capacity(capacity);
  }
}

struct Bucket {
  capacity: f64,
  refill_per_sec: f64,
  tokens: f64,
  last_refill: Instant,
}

impl Bucket {
  fn new(capacity: u32, window: Duration) -> Bucket {
    let capacity = f64::from(capacity);
    Bucket {
      capacity,
      refill_per_sec: capacity / window.as_secs_f64(),
      tokens: capacity,
      last_refill: Instant::now(),
    }
  }

  fn set_capacity(&mut self, capacity: u32) {
    self.capacity = f64::from(capacity);
    self.refill_per_sec = self.capacity / (60.0 * 60.0);
    self.tokens = self.tokens.min(self.capacity);
  }

  fn try_acquire_at(&mut self, now: Instant) -> bool {
    let elapsed = now
      .saturating_duration_since(self.last_refill)
      .as_secs_f64();
    self.tokens =
      (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    self.last_refill = now;
    if self.tokens >= 1.0 {
      self.tokens -= 1.0;
      true
    } else {
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn burst_limited_to_capacity() {
    let start = Instant::now();
    let mut bucket = Bucket::new(5, Duration::from_secs(60 * 60));
    let granted = (0..10)
      .filter(|_| bucket.try_acquire_at(start))
      .count();
    assert_eq!(granted, 5);
  }

  #[test]
  fn refills_at_capacity_per_hour() {
    let start = Instant::now();
    let mut bucket = Bucket::new(6, Duration::from_secs(60 * 60));
    for _ in 0..6 {
      assert!(bucket.try_acquire_at(start));
    }
    assert!(!bucket.try_acquire_at(start));
    // 6 per hour -> one token every 10 minutes.
    assert!(
      !bucket.try_acquire_at(start + Duration::from_secs(9 * 60))
    );
    assert!(
      bucket.try_acquire_at(start + Duration::from_secs(10 * 60))
    );
    assert!(
      !bucket.try_acquire_at(start + Duration::from_secs(10 * 60))
    );
  }

  #[test]
  fn refill_never_exceeds_capacity() {
    let start = Instant::now();
    let mut bucket = Bucket::new(2, Duration::from_secs(60 * 60));
    let later = start + Duration::from_secs(50 * 60 * 60);
    let granted =
      (0..5).filter(|_| bucket.try_acquire_at(later)).count();
    assert_eq!(granted, 2);
  }

  #[test]
  fn capacity_reload_clamps_fill() {
    let bucket = TokenBucket::per_hour(10);
    bucket.set_capacity_per_hour(1);
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());
  }
}

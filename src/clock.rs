use chrono::{DateTime, Utc};

/// Wall clock behind an interface for testability.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};

    use super::Clock;

    /// Clock pinned to a fixed instant, adjustable from tests.
    pub struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self(Mutex::new(now))
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.0.lock().unwrap() = now;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}

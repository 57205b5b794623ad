//! A one-shot boolean future: the stalled allocation path parks on it,
//! and whoever satisfies (or fails) the allocation unparks it with the
//! outcome.  No predicate rechecking; set happens exactly once.
use std::sync::Condvar;
use std::sync::Mutex;

#[derive(Default)]
pub struct Latch {
    value: Mutex<Option<bool>>,
    wakeup: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Default::default()
    }

    /// Publishes the outcome.  Calling twice is a bug.
    pub fn set(&self, result: bool) {
        let mut value = self.value.lock().unwrap();
        debug_assert!(value.is_none(), "latch set twice");

        *value = Some(result);
        self.wakeup.notify_all();
    }

    /// Blocks until the outcome is published.
    pub fn wait(&self) -> bool {
        let mut value = self.value.lock().unwrap();
        while value.is_none() {
            value = self.wakeup.wait(value).unwrap();
        }

        value.unwrap()
    }

    /// The outcome, if already published.
    pub fn peek(&self) -> Option<bool> {
        *self.value.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_before_wait() {
        let latch = Latch::new();

        latch.set(true);
        assert_eq!(latch.wait(), true);
        assert_eq!(latch.peek(), Some(true));
    }

    #[test]
    fn wait_blocks_until_set() {
        let latch = Arc::new(Latch::new());
        let setter = Arc::clone(&latch);

        let waiter = std::thread::spawn(move || latch.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        setter.set(false);

        assert_eq!(waiter.join().unwrap(), false);
    }
}

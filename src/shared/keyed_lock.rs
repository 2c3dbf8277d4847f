use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Serializes units of work that mutate the same session or execution.
/// Work for different keys proceeds concurrently; work for the same key
/// queues in arrival order on the condvar.
#[derive(Debug, Default)]
pub struct KeyedLock {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

pub struct KeyedGuard<'a> {
    lock: &'a KeyedLock,
    key: String,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> KeyedGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.insert(key.to_string());
        KeyedGuard {
            lock: self,
            key: key.to_string(),
        }
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .lock
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
        self.lock.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn same_key_is_serialized() {
        let lock = Arc::new(KeyedLock::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let in_section = Arc::clone(&in_section);
            handles.push(thread::spawn(move || {
                let _guard = lock.acquire("session-1");
                let concurrent = in_section.fetch_add(1, Ordering::SeqCst);
                assert_eq!(concurrent, 0);
                thread::sleep(std::time::Duration::from_millis(2));
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().expect("thread");
        }
    }

    #[test]
    fn different_keys_do_not_block() {
        let lock = KeyedLock::new();
        let _a = lock.acquire("a");
        let _b = lock.acquire("b");
    }
}

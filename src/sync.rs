//! Host locking seam.
//!
//! §5 requires a binary semaphore guarding the RTL singleton and a second,
//! independent one guarding lazily-initialised cache state. The core talks
//! to locks only through [`RtlLock`]; on `no_std` a host supplies its own
//! impl (e.g. over a hardware binary semaphore), while `std` provides one
//! over `std::sync::Mutex<()>`.
pub trait RtlLock {
    /// Acquire the lock, blocking the caller until it's free.
    fn lock(&self);
    /// Release a previously acquired lock.
    fn unlock(&self);
}

/// A lock held for the duration of a scope, released on drop.
pub struct Guard<'a, L: RtlLock + ?Sized> {
    lock: &'a L,
}

impl<'a, L: RtlLock + ?Sized> Guard<'a, L> {
    pub fn new(lock: &'a L) -> Self {
        lock.lock();
        Guard { lock }
    }
}

impl<'a, L: RtlLock + ?Sized> Drop for Guard<'a, L> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// `spin`-backed lock, usable with or without `std`; the default for the
/// singleton's own internal state since it needs no host collaboration.
pub struct SpinLock {
    inner: spin::Mutex<()>,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            inner: spin::Mutex::new(()),
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RtlLock for SpinLock {
    fn lock(&self) {
        core::mem::forget(self.inner.lock());
    }

    fn unlock(&self) {
        unsafe { self.inner.force_unlock() };
    }
}

#[cfg(feature = "std")]
mod std_backend {
    use super::RtlLock;

    /// Host lock over `std::sync::Mutex<()>`, for hosted targets that want
    /// OS-level blocking instead of a spinlock.
    pub struct StdLock {
        inner: std::sync::Mutex<()>,
        guard: std::sync::Mutex<Option<std::sync::MutexGuard<'static, ()>>>,
    }

    impl StdLock {
        pub fn new() -> Self {
            StdLock {
                inner: std::sync::Mutex::new(()),
                guard: std::sync::Mutex::new(None),
            }
        }
    }

    impl Default for StdLock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RtlLock for StdLock {
        fn lock(&self) {
            let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // SAFETY: `inner` outlives every guard we stash; the guard is
            // always taken back out and dropped before `self` can move.
            let g: std::sync::MutexGuard<'static, ()> = unsafe { core::mem::transmute(g) };
            *self.guard.lock().unwrap_or_else(|e| e.into_inner()) = Some(g);
        }

        fn unlock(&self) {
            let _ = self.guard.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    }
}

#[cfg(feature = "std")]
pub use std_backend::StdLock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_lock_guard_releases_on_drop() {
        let lock = SpinLock::new();
        {
            let _g = Guard::new(&lock);
        }
        // A second acquisition must not deadlock.
        let _g2 = Guard::new(&lock);
    }
}

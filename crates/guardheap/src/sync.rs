use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Block until `word` no longer holds `expected` (or a spurious wakeup).
#[inline]
fn futex_wait<T>(word: &T, expected: u32) {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const T,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (word, expected);
        core::hint::spin_loop();
    }
}

/// Wake up to `count` waiters blocked on `word`.
#[inline]
fn futex_wake<T>(word: &T, count: i32) {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const T,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        );
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (word, count);
    }
}

/// A simple mutex built on futex.
/// We cannot use std::sync::Mutex because it may allocate.
pub struct RawMutex {
    /// 0 = unlocked, 1 = locked no waiters, 2 = locked with waiters
    state: AtomicI32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        // Fast path: uncontended
        if self
            .state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            let old = self.state.swap(2, Ordering::Acquire);
            if old == 0 {
                return;
            }
            futex_wait(&self.state, 2);
        }
    }

    #[inline]
    pub fn unlock(&self) {
        let old = self.state.fetch_sub(1, Ordering::Release);
        if old != 1 {
            // There were waiters
            self.state.store(0, Ordering::Release);
            futex_wake(&self.state, 1);
        }
    }

    /// Try to lock without blocking. Returns true if lock was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Reset to unlocked regardless of the current holder.
    ///
    /// # Safety
    /// Only valid in a single-threaded post-fork child, where the holder no
    /// longer exists.
    pub unsafe fn force_unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}

/// A mutex that wraps data, similar to std::sync::Mutex but allocation-free.
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// # Safety
    /// See [`RawMutex::force_unlock`].
    pub unsafe fn force_unlock(&self) {
        self.raw.force_unlock();
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

/// Writer bit in the rw-lock state word; the low bits count readers.
const WRITER: u32 = 1 << 31;

/// A reader/writer lock built on the same futex primitives as [`RawMutex`].
///
/// It guards no data of its own: the heap uses it to serialize appends to an
/// atomically linked list against readers that want a stable view.
pub struct RawRwLock {
    state: AtomicU32,
}

unsafe impl Send for RawRwLock {}
unsafe impl Sync for RawRwLock {}

impl RawRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    pub fn read(&self) -> ReadGuard<'_> {
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current & WRITER == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return ReadGuard { lock: self };
                }
                core::hint::spin_loop();
                continue;
            }
            futex_wait(&self.state, current);
        }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current == 0 {
                if self
                    .state
                    .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return WriteGuard { lock: self };
                }
                core::hint::spin_loop();
                continue;
            }
            futex_wait(&self.state, current);
        }
    }

    fn read_unlock(&self) {
        let old = self.state.fetch_sub(1, Ordering::Release);
        if old == 1 {
            futex_wake(&self.state, i32::MAX);
        }
    }

    fn write_unlock(&self) {
        self.state.store(0, Ordering::Release);
        futex_wake(&self.state, i32::MAX);
    }

    /// # Safety
    /// See [`RawMutex::force_unlock`].
    pub unsafe fn force_unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}

pub struct ReadGuard<'a> {
    lock: &'a RawRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

pub struct WriteGuard<'a> {
    lock: &'a RawRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

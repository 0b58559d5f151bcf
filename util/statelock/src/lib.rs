use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;

/// A pthread-backed lock owning the state it guards.
///
/// Unlike the scheduler-aware locks in tokio, this is a plain thread-level
/// primitive: it may be acquired from async tasks, worker threads, and
/// signal-listener callbacks alike, as long as critical sections stay short
/// and never suspend while holding the guard.
///
/// The underlying mutex is created with `PTHREAD_MUTEX_ERRORCHECK`, so
/// recursive acquisition and foreign unlocks abort loudly instead of
/// deadlocking forever.
pub struct Lock<T> {
	raw: RawMutex,
	value: UnsafeCell<T>,
}

// The raw mutex serializes all access to `value`.
unsafe impl<T: Send> Send for Lock<T> {}
unsafe impl<T: Send> Sync for Lock<T> {}

impl<T> Lock<T> {
	/// Creates a new lock guarding `value`.
	pub fn new(value: T) -> Self {
		Self { raw: RawMutex::new(), value: UnsafeCell::new(value) }
	}

	/// Blocks the calling thread until exclusive access is obtained.
	pub fn lock(&self) -> LockGuard<'_, T> {
		self.raw.lock();
		LockGuard { lock: self, _not_send: PhantomData }
	}

	/// Attempts to acquire the lock without blocking.
	pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
		if self.raw.try_lock() {
			Some(LockGuard { lock: self, _not_send: PhantomData })
		} else {
			None
		}
	}

	/// Runs `body` with exclusive access to the guarded state.
	///
	/// The lock is released on every exit path, including unwinds out of
	/// `body`.
	pub fn with_lock<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
		let mut guard = self.lock();
		body(&mut guard)
	}

	/// Like [`Lock::with_lock`], but returns `None` if the lock is held.
	pub fn try_with_lock<R>(&self, body: impl FnOnce(&mut T) -> R) -> Option<R> {
		let mut guard = self.try_lock()?;
		Some(body(&mut guard))
	}

	/// Consumes the lock and returns the guarded value.
	pub fn into_inner(self) -> T {
		self.value.into_inner()
	}
}

impl<T: fmt::Debug> fmt::Debug for Lock<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.try_lock() {
			Some(guard) => f.debug_tuple("Lock").field(&*guard).finish(),
			None => f.write_str("Lock(<locked>)"),
		}
	}
}

impl<T: Default> Default for Lock<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

/// Scoped access to the state guarded by a [`Lock`].
///
/// Releases the lock when dropped. The guard is deliberately `!Send`:
/// pthread mutexes must be unlocked by the thread that locked them.
pub struct LockGuard<'a, T> {
	lock: &'a Lock<T>,
	_not_send: PhantomData<*const ()>,
}

impl<T> Deref for LockGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		// Safety: the raw mutex is held for the lifetime of the guard.
		unsafe { &*self.lock.value.get() }
	}
}

impl<T> DerefMut for LockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		// Safety: the raw mutex is held for the lifetime of the guard.
		unsafe { &mut *self.lock.value.get() }
	}
}

impl<T> Drop for LockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.raw.unlock();
	}
}

/// Heap-pinned `pthread_mutex_t` of type `PTHREAD_MUTEX_ERRORCHECK`.
///
/// pthread mutexes are address-sensitive once initialized, so the native
/// handle lives in a pinned box and is never moved or copied.
struct RawMutex {
	inner: Pin<Box<UnsafeCell<libc::pthread_mutex_t>>>,
}

impl RawMutex {
	fn new() -> Self {
		let inner = Box::pin(UnsafeCell::new(unsafe {
			MaybeUninit::<libc::pthread_mutex_t>::zeroed().assume_init()
		}));

		unsafe {
			let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
			let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
			assert_eq!(rc, 0, "pthread_mutexattr_init failed: {rc}");

			libc::pthread_mutexattr_settype(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ERRORCHECK);

			let rc = libc::pthread_mutex_init(inner.get(), attr.as_ptr());
			libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
			assert_eq!(rc, 0, "pthread_mutex_init failed: {rc}");
		}

		Self { inner }
	}

	fn lock(&self) {
		let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
		if rc != 0 {
			// EDEADLK under ERRORCHECK means recursive acquisition by the
			// same thread, which is a caller bug.
			panic!("pthread_mutex_lock failed: {rc}");
		}
	}

	fn try_lock(&self) -> bool {
		let rc = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
		match rc {
			0 => true,
			libc::EBUSY => false,
			rc => panic!("pthread_mutex_trylock failed: {rc}"),
		}
	}

	fn unlock(&self) {
		let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
		if rc != 0 {
			panic!("pthread_mutex_unlock failed: {rc}");
		}
	}
}

impl Drop for RawMutex {
	fn drop(&mut self) {
		unsafe {
			libc::pthread_mutex_destroy(self.inner.get());
		}
	}
}

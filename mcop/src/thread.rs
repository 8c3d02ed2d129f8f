//! Thread primitives behind a swappable strategy.
//!
//! Everything that needs a lock, a condition variable or a dedicated execution
//! context asks a [`Threads`] context for one. The context starts out with the
//! [`NoThreads`] fallback, in which locks are no-ops and "starting a thread"
//! runs its body synchronously, so code written against these wrappers keeps
//! working in a single-threaded process. Registering [`NativeThreads`] at
//! startup switches every object created afterwards to real OS primitives.

use crate::error::{Error, Result};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar as StdCondvar, Mutex as StdMutex};
use std::thread::{JoinHandle, ThreadId};
use tracing::{debug, warn};

pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

pub trait MutexImpl: Send + Sync {
    fn lock(&self);
    fn try_lock(&self) -> bool;
    fn unlock(&self);
}

pub trait ConditionImpl: Send + Sync {
    /// `mutex` must be locked by the caller; it is locked again on return.
    fn wait(&self, mutex: &dyn MutexImpl);
    fn signal(&self);
    fn broadcast(&self);
}

pub trait ThreadImpl: Send {
    fn wait_for_termination(&mut self);
    fn is_running(&self) -> bool;
}

/// The capability interface a threading strategy provides.
pub trait SystemThreads: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether waits can actually block (i.e. another context can wake them).
    fn supports_threads(&self) -> bool;
    fn is_main_thread(&self) -> bool;
    /// Small integer identifying the calling execution context.
    fn current_id(&self) -> usize;
    fn create_mutex(&self) -> Box<dyn MutexImpl>;
    fn create_condition(&self) -> Box<dyn ConditionImpl>;
    fn spawn(&self, name: &str, body: ThreadBody) -> std::io::Result<Box<dyn ThreadImpl>>;
}

// ---- native ---------------------------------------------------------------

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_ID: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug)]
pub struct NativeThreads {
    main: ThreadId,
}

impl NativeThreads {
    /// The calling thread becomes the main context.
    pub fn new() -> Self {
        Self {
            main: std::thread::current().id(),
        }
    }
}

impl Default for NativeThreads {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct NativeMutex {
    locked: StdMutex<bool>,
    unlocked: StdCondvar,
}

impl MutexImpl for NativeMutex {
    fn lock(&self) {
        let mut locked = self.locked.lock().expect("native mutex poisoned");
        while *locked {
            locked = self.unlocked.wait(locked).expect("native mutex poisoned");
        }
        *locked = true;
    }

    fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock().expect("native mutex poisoned");
        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock().expect("native mutex poisoned");
        debug_assert!(*locked, "unlock of a mutex that is not locked");
        *locked = false;
        drop(locked);
        self.unlocked.notify_one();
    }
}

/// Condition variable over an explicit lock/unlock mutex. Waiters park on a
/// generation counter, which is taken before the user mutex is released so a
/// signal in between cannot be lost.
#[derive(Debug, Default)]
struct NativeCondition {
    generation: StdMutex<u64>,
    changed: StdCondvar,
}

impl ConditionImpl for NativeCondition {
    fn wait(&self, mutex: &dyn MutexImpl) {
        let mut generation = self.generation.lock().expect("condition poisoned");
        let start = *generation;
        mutex.unlock();
        while *generation == start {
            generation = self.changed.wait(generation).expect("condition poisoned");
        }
        drop(generation);
        mutex.lock();
    }

    fn signal(&self) {
        let mut generation = self.generation.lock().expect("condition poisoned");
        *generation = generation.wrapping_add(1);
        self.changed.notify_one();
    }

    fn broadcast(&self) {
        let mut generation = self.generation.lock().expect("condition poisoned");
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }
}

struct NativeThread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl ThreadImpl for NativeThread {
    fn wait_for_termination(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("thread '{}' panicked", self.name);
        }
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl SystemThreads for NativeThreads {
    fn name(&self) -> &'static str {
        "native"
    }

    fn supports_threads(&self) -> bool {
        true
    }

    fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.main
    }

    fn current_id(&self) -> usize {
        if self.is_main_thread() {
            return 0;
        }
        THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
    }

    fn create_mutex(&self) -> Box<dyn MutexImpl> {
        Box::new(NativeMutex::default())
    }

    fn create_condition(&self) -> Box<dyn ConditionImpl> {
        Box::new(NativeCondition::default())
    }

    fn spawn(&self, name: &str, body: ThreadBody) -> std::io::Result<Box<dyn ThreadImpl>> {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        Ok(Box::new(NativeThread {
            name: name.to_string(),
            handle: Some(handle),
        }))
    }
}

// ---- fallback -------------------------------------------------------------

/// Single execution context. `depth` counts synchronously running "threads"
/// so `current_id` still tells nested bodies apart.
#[derive(Debug, Default)]
pub struct NoThreads {
    depth: AtomicUsize,
}

struct NoMutex;

impl MutexImpl for NoMutex {
    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    fn unlock(&self) {}
}

struct NoCondition;

impl ConditionImpl for NoCondition {
    fn wait(&self, _mutex: &dyn MutexImpl) {
        warn!("condition wait without thread support returns immediately");
    }

    fn signal(&self) {}

    fn broadcast(&self) {}
}

struct FinishedThread;

impl ThreadImpl for FinishedThread {
    fn wait_for_termination(&mut self) {}

    fn is_running(&self) -> bool {
        false
    }
}

impl SystemThreads for NoThreads {
    fn name(&self) -> &'static str {
        "none"
    }

    fn supports_threads(&self) -> bool {
        false
    }

    fn is_main_thread(&self) -> bool {
        true
    }

    fn current_id(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn create_mutex(&self) -> Box<dyn MutexImpl> {
        Box::new(NoMutex)
    }

    fn create_condition(&self) -> Box<dyn ConditionImpl> {
        Box::new(NoCondition)
    }

    fn spawn(&self, name: &str, body: ThreadBody) -> std::io::Result<Box<dyn ThreadImpl>> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("running '{name}' synchronously at depth {depth}");
        body();
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Ok(Box::new(FinishedThread))
    }
}

// ---- context --------------------------------------------------------------

/// Owns the active strategy. Selection needs `&mut self`, so it happens before
/// the context is shared and never changes underneath live objects.
pub struct Threads {
    registered: Option<Arc<dyn SystemThreads>>,
    fallback: Arc<NoThreads>,
}

impl std::fmt::Debug for Threads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Threads")
            .field("active", &self.active().name())
            .finish()
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}

impl Threads {
    pub fn new() -> Self {
        Self {
            registered: None,
            fallback: Arc::new(NoThreads::default()),
        }
    }

    pub fn native() -> Self {
        let mut threads = Self::new();
        threads.registered = Some(Arc::new(NativeThreads::new()));
        threads
    }

    pub fn register(&mut self, strategy: Arc<dyn SystemThreads>) -> Result<()> {
        if let Some(existing) = &self.registered {
            return Err(Error::AlreadyRegistered(existing.name()));
        }
        debug!("registered '{}' thread strategy", strategy.name());
        self.registered = Some(strategy);
        Ok(())
    }

    /// Restores the fallback. Objects created earlier keep their implementation.
    pub fn unregister(&mut self) -> Option<Arc<dyn SystemThreads>> {
        self.registered.take()
    }

    pub fn active(&self) -> &dyn SystemThreads {
        match &self.registered {
            Some(strategy) => strategy.as_ref(),
            None => self.fallback.as_ref(),
        }
    }

    fn active_arc(&self) -> Arc<dyn SystemThreads> {
        match &self.registered {
            Some(strategy) => strategy.clone(),
            None => self.fallback.clone(),
        }
    }

    pub fn supported(&self) -> bool {
        self.active().supports_threads()
    }

    pub fn is_main_thread(&self) -> bool {
        self.active().is_main_thread()
    }

    pub fn current_id(&self) -> usize {
        self.active().current_id()
    }
}

// ---- wrappers -------------------------------------------------------------

pub struct Mutex {
    inner: Box<dyn MutexImpl>,
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Mutex {
    pub fn new(threads: &Threads) -> Self {
        Self {
            inner: threads.active().create_mutex(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_> {
        self.inner.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        if self.inner.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.inner.unlock();
    }
}

pub struct Condition {
    inner: Box<dyn ConditionImpl>,
}

impl Condition {
    pub fn new(threads: &Threads) -> Self {
        Self {
            inner: threads.active().create_condition(),
        }
    }

    pub fn wait(&self, guard: &MutexGuard<'_>) {
        self.inner.wait(guard.mutex.inner.as_ref());
    }

    pub fn signal(&self) {
        self.inner.signal();
    }

    pub fn broadcast(&self) {
        self.inner.broadcast();
    }
}

pub struct Thread {
    name: String,
    strategy: Arc<dyn SystemThreads>,
    body: Option<ThreadBody>,
    inner: Option<Box<dyn ThreadImpl>>,
}

impl Thread {
    pub fn new(threads: &Threads, name: &str, body: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            strategy: threads.active_arc(),
            body: Some(Box::new(body)),
            inner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        let Some(body) = self.body.take() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("thread '{}' already started", self.name),
            ));
        };
        self.inner = Some(self.strategy.spawn(&self.name, body)?);
        Ok(())
    }

    pub fn wait_for_termination(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.wait_for_termination();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.as_ref().is_some_and(|t| t.is_running())
    }
}

/// Counting semaphore on top of [`Mutex`] and [`Condition`].
pub struct Semaphore {
    mutex: Mutex,
    available: Condition,
    count: AtomicUsize,
    can_block: bool,
}

impl Semaphore {
    pub fn new(threads: &Threads, value: usize) -> Self {
        Self {
            mutex: Mutex::new(threads),
            available: Condition::new(threads),
            count: AtomicUsize::new(value),
            can_block: threads.supported(),
        }
    }

    /// Blocks until the count is positive, then decrements it.
    ///
    /// # Panics
    ///
    /// Without thread support nothing could ever post, so waiting on a zero
    /// count panics instead of hanging.
    pub fn wait(&self) {
        let guard = self.mutex.lock();
        while self.count.load(Ordering::Acquire) == 0 {
            assert!(
                self.can_block,
                "semaphore wait would never return without thread support"
            );
            self.available.wait(&guard);
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn try_wait(&self) -> bool {
        let _guard = self.mutex.lock();
        if self.count.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub fn post(&self) {
        let _guard = self.mutex.lock();
        self.count.fetch_add(1, Ordering::AcqRel);
        self.available.signal();
    }

    pub fn value(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Only valid while nobody waits on the semaphore.
    pub fn reset(&self, value: usize) {
        let _guard = self.mutex.lock();
        self.count.store(value, Ordering::Release);
    }
}

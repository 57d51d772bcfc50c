//! Worker thread helper
//!
//! Named OS threads that publish their kernel tid before the spawner
//! proceeds, so the scheduler can address workers immediately.

use std::cell::{Cell, RefCell};
use std::sync::mpsc;
use std::thread::JoinHandle;

use weft_core::werror;

use crate::platform::gettid;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("main"));
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Kernel tid of the calling thread (cached per thread)
#[inline]
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|c| {
        let mut id = c.get();
        if id == 0 {
            id = gettid();
            c.set(id);
        }
        id
    })
}

/// Name of the calling thread as set by [`Thread::spawn`]
pub fn current_thread_name() -> String {
    THREAD_NAME.with(|c| c.borrow().clone())
}

/// A named OS thread owned by the scheduler
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: u64,
    name: String,
}

impl Thread {
    /// Spawn a named thread and wait until it has published its tid
    pub fn spawn<F>(name: &str, f: F) -> std::io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = if name.is_empty() { "unnamed" } else { name }.to_string();
        let thread_name = name.clone();
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                THREAD_NAME.with(|c| *c.borrow_mut() = thread_name);
                let _ = tx.send(current_thread_id());
                f();
            })?;

        let id = rx.recv().unwrap_or(0);
        Ok(Thread {
            handle: Some(handle),
            id,
            name,
        })
    }

    /// Kernel tid of the spawned thread
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                werror!("thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // A dropped-but-unjoined thread is detached, as with pthreads
        drop(self.handle.take());
    }
}

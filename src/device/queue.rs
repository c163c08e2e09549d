//! Device and submission queue.
//!
//! The host backend runs all device work on a dedicated worker thread fed
//! through a channel. Submission is FIFO; each operation first waits on its
//! explicit prerequisite events. Because prerequisites always refer to
//! earlier submissions on the same queue or to host-side events, FIFO
//! execution is a valid schedule of the ordering contract and cannot
//! deadlock.
//!
//! A panic inside an operation is caught, recorded on the device and the
//! operation's event is still signalled, keeping every event safe to wait
//! on after a failure.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use super::event::Event;

enum Job {
    Run {
        wait: Vec<Event>,
        action: Box<dyn FnOnce() + Send>,
        signal: Event,
    },
    Stop,
}

struct DeviceCore {
    sender: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    error: Arc<Mutex<Option<String>>>,
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        let _ = self.sender.send(Job::Stop);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// A compute device. The host backend executes operations on a worker
/// thread and shares memory with the host.
#[derive(Clone)]
pub struct Device {
    core: Arc<DeviceCore>,
}

impl Device {
    /// Bring up the device and its worker.
    pub fn new() -> Device {
        let (sender, receiver) = unbounded::<Job>();
        let error = Arc::new(Mutex::new(None));
        let worker_error = Arc::clone(&error);

        let handle = std::thread::Builder::new()
            .name("akasha-device".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    match job {
                        Job::Run {
                            wait,
                            action,
                            signal,
                        } => {
                            for event in &wait {
                                event.wait();
                            }
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(action)) {
                                let message = panic
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| panic.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "device operation failed".to_string());
                                log::error!("device operation failed: {message}");
                                *worker_error.lock() = Some(message);
                            }
                            signal.signal();
                        }
                        Job::Stop => break,
                    }
                }
            })
            .expect("failed to spawn device worker");

        Device {
            core: Arc::new(DeviceCore {
                sender,
                worker: Mutex::new(Some(handle)),
                error,
            }),
        }
    }

    /// A submission queue onto this device.
    pub fn queue(&self) -> Queue {
        Queue {
            core: Arc::clone(&self.core),
        }
    }

    /// Whether the device shares memory with the host. Always true for the
    /// host backend; mapped transfers are then free.
    pub fn unified_memory(&self) -> bool {
        true
    }

    /// Take the most recent operation failure, if any.
    pub fn take_error(&self) -> Option<String> {
        self.core.error.lock().take()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO submission queue.
#[derive(Clone)]
pub struct Queue {
    core: Arc<DeviceCore>,
}

impl Queue {
    /// Submit an operation that runs after every event in `wait` has
    /// completed. Returns the operation's completion event.
    pub fn submit(&self, wait: &[Event], action: impl FnOnce() + Send + 'static) -> Event {
        let event = Event::pending();
        let job = Job::Run {
            wait: wait.to_vec(),
            action: Box::new(action),
            signal: event.clone(),
        };
        if self.core.sender.send(job).is_err() {
            // Device already shut down; nothing will run, complete the
            // event so callers cannot hang.
            event.signal();
        }
        event
    }

    /// An event completing once everything currently queued has executed.
    pub fn barrier(&self) -> Event {
        self.submit(&[], || {})
    }

    /// Block until everything currently queued has executed.
    pub fn finish(&self) {
        self.barrier().wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo_execution_order() {
        let device = Device::new();
        let queue = device.queue();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let order = Arc::clone(&order);
            queue.submit(&[], move || order.lock().push(i));
        }
        queue.finish();
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_operations_wait_on_prerequisites() {
        let device = Device::new();
        let queue = device.queue();
        let counter = Arc::new(AtomicUsize::new(0));

        let gate = Event::pending();
        let c = Arc::clone(&counter);
        let gated = queue.submit(&[gate.clone()], move || {
            c.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        gate.signal();
        gated.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_operation_still_signals() {
        let device = Device::new();
        let queue = device.queue();
        let event = queue.submit(&[], || panic!("deliberate failure"));
        event.wait();
        assert!(device.take_error().is_some());
        assert!(device.take_error().is_none());

        // The worker survives and keeps executing.
        let after = queue.submit(&[], || {});
        after.wait();
    }
}

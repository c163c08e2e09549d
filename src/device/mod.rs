//! Device abstraction: buffers, events and a FIFO submission queue.
//!
//! This is the contract the accelerated mapping pipeline is written
//! against. The in-tree backend executes on a host worker thread (with the
//! region-update kernel fanning out over a thread pool), which keeps the
//! pipeline's ordering and residency semantics fully exercised without any
//! particular accelerator API; a CUDA/OpenCL-style backend would implement
//! the same surface.

mod buffer;
mod event;
mod queue;

pub use buffer::{DeviceBuffer, PinMode, PinnedBuffer};
pub use event::Event;
pub use queue::{Device, Queue};

//! Isolated, stateful code execution kernels.
//!
//! A kernel is an OS process running a persistent interpreter, exclusively
//! owned by one session. The pool bounds how many exist at once, serializes
//! executions per kernel, and evicts idle kernels least-recently-used first.

mod error;
mod pool;
mod process;

pub use error::{KernelError, Result};
pub use pool::{KernelHandle, KernelPool, KernelSlot};
pub use process::{
    DriverStatus, KernelMessage, KernelProcess, StreamName, interpreter_available,
};

// src/lib.rs
//! Single-threaded event loop where every request runs in a coroutine that
//! can park itself on a [`Continuation`] and be resumed by anyone holding
//! it: another request, a deferred call, or a spawned task.
pub mod args;
pub mod config;
mod conn;
pub mod continuation;
mod coroutine;
pub mod error;
pub mod http;
pub mod logging;
pub mod parser;
pub mod runtime;
mod scheduler;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod timer;
pub mod trampoline;

pub use args::Args;
pub use config::Config;
pub use continuation::{Continuation, ContinuationState};
pub use error::{EtudeError, EtudeResult, UsageError};
pub use http::{Context, Handler, Method, Request, Response, Version};
pub use runtime::Handle;
pub use server::Server;
pub use syscalls::Interest;
pub use timer::Timer;
pub use trampoline::{Socket, cancel_wait, trampoline, wait_read, wait_readwrite, wait_write};

//! Synchronization abstractions shared by the memory crates.
//!
//! The allocator crates are generic over the lock type and over the notion of
//! "the execution unit I am running on", so that the same code runs on bare
//! metal (with [`SpinLock`] and a hart-backed [`Cpu`]) and in host tests (with
//! `std::sync::Mutex` and [`ThreadCpu`], behind the `std` feature).

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use self::{
    cpu::Cpu,
    mutex::Mutex,
    spin_lock::{SpinLock, SpinLockGuard},
};
#[cfg(any(test, feature = "std"))]
pub use self::cpu::{ThreadCpu, ThreadInterruptGuard};

mod cpu;
mod mutex;
mod spin_lock;

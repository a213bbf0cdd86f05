/// The execution unit (hart) the caller is running on.
///
/// Per-CPU data structures use this to pick their local slot, and to keep
/// that choice stable for the duration of an operation by turning interrupts
/// off first: a process cannot migrate to another CPU while its interrupts
/// are disabled.
pub trait Cpu {
    /// Guard returned by [`Cpu::push_disabled`].
    ///
    /// Dropping it restores the interrupt state saved by the matching push.
    type InterruptGuard;

    /// Returns the current CPU's ID.
    ///
    /// Must be called with interrupts disabled, to prevent a race with the
    /// process being moved to a different CPU.
    fn current_id() -> usize;

    /// Saves the current interrupt enable state and disables interrupts.
    ///
    /// Calls nest; interrupts are re-enabled only when the outermost guard is
    /// dropped and they were enabled before the outermost push.
    fn push_disabled() -> Self::InterruptGuard;
}

#[cfg(any(test, feature = "std"))]
pub use self::thread::{ThreadCpu, ThreadInterruptGuard};

#[cfg(any(test, feature = "std"))]
mod thread {
    use core::{cell::Cell, marker::PhantomData};

    use super::Cpu;

    std::thread_local! {
        static CPU_ID: Cell<usize> = const { Cell::new(0) };
        static DISABLED_DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    /// A [`Cpu`] for host tests where every OS thread plays one hart.
    ///
    /// Threads start on CPU 0 and can be moved with [`ThreadCpu::set_current`].
    /// Interrupts do not exist on the host; the guard only keeps a per-thread
    /// nesting depth so tests can check that pushes and pops are balanced.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ThreadCpu;

    impl ThreadCpu {
        /// Binds the calling thread to CPU `id`.
        pub fn set_current(id: usize) {
            CPU_ID.with(|cpu| cpu.set(id));
        }

        /// Returns the number of live interrupt guards on the calling thread.
        #[must_use]
        pub fn disabled_depth() -> usize {
            DISABLED_DEPTH.with(Cell::get)
        }
    }

    impl Cpu for ThreadCpu {
        type InterruptGuard = ThreadInterruptGuard;

        fn current_id() -> usize {
            assert!(
                Self::disabled_depth() > 0,
                "CPU id read with interrupts enabled"
            );
            CPU_ID.with(Cell::get)
        }

        fn push_disabled() -> Self::InterruptGuard {
            DISABLED_DEPTH.with(|depth| depth.set(depth.get() + 1));
            ThreadInterruptGuard {
                _not_send: PhantomData,
            }
        }
    }

    /// Interrupt guard of [`ThreadCpu`].
    #[derive(Debug)]
    pub struct ThreadInterruptGuard {
        _not_send: PhantomData<*const ()>,
    }

    impl Drop for ThreadInterruptGuard {
        fn drop(&mut self) {
            DISABLED_DEPTH.with(|depth| {
                let current = depth.get();
                assert!(current > 0, "unbalanced interrupt guard");
                depth.set(current - 1);
            });
        }
    }

}

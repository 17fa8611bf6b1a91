use crate::guard::OutOfRangeCheck;
use crate::tuning::Tuner;
use chanorm_accelerate_api::{AccelResult, KernelRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// `compute` returns after the kernel has completed.
    #[default]
    Blocking,
    /// `compute` returns right after submission and leaves a
    /// [`KernelFuture`] in the context.
    Deferred,
}

/// Completion handle of a submitted launch.
///
/// Dropping it does not cancel the device work; it only skips the
/// post-dispatch bounds check.
#[must_use = "waiting is the only way to observe failures reported after submission"]
pub struct KernelFuture<E> {
    event: E,
    check: Option<OutOfRangeCheck>,
}

impl<E> KernelFuture<E> {
    pub fn new(event: E, check: Option<OutOfRangeCheck>) -> Self {
        Self { event, check }
    }

    pub fn wait<R: KernelRuntime<Event = E>>(self, runtime: &R) -> AccelResult<()> {
        runtime.wait(self.event)?;
        match self.check {
            Some(check) => check.validate(runtime),
            None => Ok(()),
        }
    }
}

/// Per-call environment of an operator: the runtime, the shared tuner and
/// whether the caller waits for completion.
pub struct OpContext<'a, R: KernelRuntime> {
    runtime: &'a R,
    tuner: &'a Tuner,
    mode: LaunchMode,
    future: Option<KernelFuture<R::Event>>,
}

impl<'a, R: KernelRuntime> OpContext<'a, R> {
    pub fn new(runtime: &'a R, tuner: &'a Tuner) -> Self {
        Self::with_mode(runtime, tuner, LaunchMode::Blocking)
    }

    pub fn deferred(runtime: &'a R, tuner: &'a Tuner) -> Self {
        Self::with_mode(runtime, tuner, LaunchMode::Deferred)
    }

    pub fn with_mode(runtime: &'a R, tuner: &'a Tuner, mode: LaunchMode) -> Self {
        Self {
            runtime,
            tuner,
            mode,
            future: None,
        }
    }

    pub fn runtime(&self) -> &'a R {
        self.runtime
    }

    pub fn tuner(&self) -> &'a Tuner {
        self.tuner
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    pub fn has_pending(&self) -> bool {
        self.future.is_some()
    }

    pub fn take_future(&mut self) -> Option<KernelFuture<R::Event>> {
        self.future.take()
    }

    /// Wait for the pending launch, if any, and report its failure.
    ///
    /// Operators call this before touching device state a pending launch
    /// may still read, so a compute on a deferred context first returns the
    /// previous launch's error.
    pub fn wait(&mut self) -> AccelResult<()> {
        match self.future.take() {
            Some(future) => future.wait(self.runtime),
            None => Ok(()),
        }
    }

    pub(crate) fn complete(&mut self, future: KernelFuture<R::Event>) -> AccelResult<()> {
        match self.mode {
            LaunchMode::Blocking => future.wait(self.runtime),
            LaunchMode::Deferred => match self.future.replace(future) {
                Some(previous) => {
                    log::debug!("settling a pending launch before parking the next one");
                    previous.wait(self.runtime)
                }
                None => Ok(()),
            },
        }
    }
}

//! Native function storage.
//!
//! Every VM function is a Rust callable in the style of a C API function:
//! it receives the running [`Thread`], reads its arguments from stack indices
//! `1..=get_top()`, pushes its results and returns how many it pushed.

use std::fmt;
use std::rc::Rc;

use crate::error::VmError;
use crate::state::Thread;

/// Trait for callable native functions.
pub trait NativeCallable {
    fn call(&self, thread: &Thread) -> Result<usize, VmError>;
}

impl<F> NativeCallable for F
where
    F: Fn(&Thread) -> Result<usize, VmError>,
{
    fn call(&self, thread: &Thread) -> Result<usize, VmError> {
        (self)(thread)
    }
}

/// A VM function value.
///
/// Identity is the allocation: two `FunctionRef`s are the same function iff
/// they point at the same `NativeFunction`.
pub struct NativeFunction {
    name: Option<Rc<str>>,
    inner: Box<dyn NativeCallable>,
}

/// Shared handle to a [`NativeFunction`].
pub type FunctionRef = Rc<NativeFunction>;

impl NativeFunction {
    pub fn new<F>(name: Option<&str>, f: F) -> FunctionRef
    where
        F: Fn(&Thread) -> Result<usize, VmError> + 'static,
    {
        Rc::new(Self {
            name: name.map(Rc::from),
            inner: Box::new(f),
        })
    }

    /// Debug name given at creation.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn invoke(&self, thread: &Thread) -> Result<usize, VmError> {
        self.inner.call(thread)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

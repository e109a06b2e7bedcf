//! The ambient value that is propagated.
//!
//! A `Context` is a cheap-to-clone snapshot. It is never mutated in place:
//! changing what is ambient means installing a different `Context` through a
//! context manager.

use std::any::Any;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

/// An opaque handle to a segment owned by the trace tree.
///
/// The handle only shares ownership of the segment, it never inspects or
/// mutates it. Two handles compare equal when they refer to the same segment
/// allocation, regardless of the segment's contents.
#[derive(Clone)]
pub struct SegmentRef(Arc<dyn Any + Send + Sync>);

impl SegmentRef {
    pub fn new<T: Any + Send + Sync>(segment: Arc<T>) -> SegmentRef {
        SegmentRef(segment)
    }

    /// Recovers the concrete segment type this handle was created from.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &SegmentRef) -> bool {
        // compare the data pointers only, vtable pointers for the same type
        // are not guaranteed to be unique
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }
}

impl<T: Any + Send + Sync> From<Arc<T>> for SegmentRef {
    fn from(segment: Arc<T>) -> SegmentRef {
        SegmentRef::new(segment)
    }
}

impl PartialEq for SegmentRef {
    fn eq(&self, other: &SegmentRef) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for SegmentRef {}

impl Debug for SegmentRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "SegmentRef({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// The value a context manager makes ambient for a logical flow of execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    segment: Option<SegmentRef>,
}

impl Context {
    pub fn new(segment: Option<SegmentRef>) -> Context {
        Context { segment }
    }

    pub fn with_segment<S: Into<SegmentRef>>(segment: S) -> Context {
        Context {
            segment: Some(segment.into()),
        }
    }

    pub fn segment(&self) -> Option<&SegmentRef> {
        self.segment.as_ref()
    }

    /// Returns a new context with the segment replaced, leaving `self` as is.
    pub fn set_segment<S: Into<SegmentRef>>(&self, segment: Option<S>) -> Context {
        Context {
            segment: segment.map(Into::into),
        }
    }

    pub fn has_segment(&self) -> bool {
        self.segment.is_some()
    }
}

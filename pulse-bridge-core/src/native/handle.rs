use std::fmt;
use std::num::NonZeroUsize;

/// Opaque identifier of a native object (mainloop, context, operation, stream).
///
/// Never null. Backends over a C library store the object pointer here.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonZeroUsize);

impl RawHandle {
    pub fn new(value: usize) -> Option<Self> {
        NonZeroUsize::new(value).map(Self)
    }

    pub fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

type ReleaseFn = Box<dyn FnOnce(RawHandle) + Send + Sync + 'static>;

/// Exactly-once owner of a native object.
///
/// The release function runs at most once, either through [`release`](Self::release)
/// or on drop. Reading the raw identifier after release panics.
pub struct NativeHandle {
    kind: &'static str,
    raw: Option<RawHandle>,
    release: Option<ReleaseFn>,
}

impl NativeHandle {
    /// Create the object with `factory` and take ownership of it.
    ///
    /// A factory error is returned unchanged and nothing is released.
    pub fn acquire<E, F, R>(kind: &'static str, factory: F, release: R) -> Result<Self, E>
    where
        F: FnOnce() -> Result<RawHandle, E>,
        R: FnOnce(RawHandle) + Send + Sync + 'static,
    {
        let raw = factory()?;
        log::trace!("acquired native {} {:?}", kind, raw);
        Ok(Self {
            kind,
            raw: Some(raw),
            release: Some(Box::new(release)),
        })
    }

    /// The raw identifier.
    ///
    /// # Panics
    /// If the handle has already been released.
    pub fn raw(&self) -> RawHandle {
        match self.raw {
            Some(raw) => raw,
            None => panic!("native {} handle used after release", self.kind),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.raw.is_some()
    }

    /// Run the release function. Returns false if it had already run.
    pub fn release(&mut self) -> bool {
        let (Some(raw), Some(release)) = (self.raw.take(), self.release.take()) else {
            return false;
        };
        log::trace!("releasing native {} {:?}", self.kind, raw);
        release(raw);
        true
    }

    /// Give up ownership without running the release function.
    ///
    /// For objects that cannot be released from the current thread.
    pub(crate) fn leak(&mut self) {
        if let (Some(raw), Some(_)) = (self.raw.take(), self.release.take()) {
            log::warn!("leaking native {} {:?}", self.kind, raw);
        }
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .finish()
    }
}

//! Kernel record sources.
//!
//! A reader only needs three things from the kernel side: attach with a
//! per-CPU buffer size, read the next record (with the lost-sample count
//! reported alongside it), and close. [`EventSource`] and [`RecordRead`]
//! capture exactly that, so the reader loop runs unchanged against aya perf
//! buffers in production and against in-memory fakes in tests.

use bytes::Bytes;
use std::future::Future;
use std::io;
use tokio_util::sync::CancellationToken;

/// Default per-CPU buffer size, in pages.
pub const DEFAULT_PAGES_PER_CPU: usize = 64;

/// One read from a source.
///
/// `raw_sample` is `None` when the read only carried a loss notification.
#[derive(Clone, Debug, Default)]
pub struct Record {
    pub cpu: u32,
    pub raw_sample: Option<Bytes>,
    pub lost_samples: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum AttachError {
    #[error("event map {0} not found")]
    MapNotFound(String),
    #[error("failed to open {source_name} buffer on CPU {cpu}: {reason}")]
    Open {
        source_name: String,
        cpu: u32,
        reason: String,
    },
    #[error("failed to list online CPUs: {0}")]
    OnlineCpus(#[source] io::Error),
    #[error("failed to attach {source_name}: {reason}")]
    Other { source_name: String, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    /// The source was closed; expected on shutdown.
    #[error("source closed")]
    Closed,
    /// End-of-stream or incomplete read; the next read may succeed.
    #[error("incomplete read: {0}")]
    Transient(String),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("read failed: {0}")]
    Other(String),
}

/// Closes a source from outside the task that is reading it. A pending
/// [`RecordRead::read`] returns [`ReadError::Closed`] once the source is closed.
#[derive(Clone, Debug, Default)]
pub struct Closer(CancellationToken);

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once [`Closer::close`] has been called.
    pub async fn closed(&self) {
        self.0.cancelled().await
    }
}

/// An attached, readable record stream.
pub trait RecordRead: Send + 'static {
    fn read(&mut self) -> impl Future<Output = Result<Record, ReadError>> + Send;

    fn closer(&self) -> Closer;
}

/// A not-yet-attached source.
pub trait EventSource {
    type Records: RecordRead;

    fn name(&self) -> &str;

    /// Attach with `per_cpu_bytes` of buffer per CPU.
    fn attach(self, per_cpu_bytes: usize) -> Result<Self::Records, AttachError>;
}

/// Per-CPU buffer size in bytes.
///
/// Starts at `pages * page_size` and grows to the smallest multiple of that
/// chunk strictly larger than `max_event_size`, so one maximal record always
/// fits.
pub fn per_cpu_buffer_size(page_size: usize, pages: usize, max_event_size: usize) -> usize {
    let chunk = page_size * pages.max(1);
    if max_event_size >= chunk {
        chunk * (1 + max_event_size / chunk)
    } else {
        chunk
    }
}

/// System page size.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Whether an error chain bottoms out in an end-of-stream style I/O error.
pub fn is_end_of_stream(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_size_when_event_fits() {
        assert_eq!(per_cpu_buffer_size(4096, 64, 1500), 4096 * 64);
    }

    #[test]
    fn grows_when_event_equals_chunk() {
        let chunk = 4096 * 64;
        assert_eq!(per_cpu_buffer_size(4096, 64, chunk), chunk * 2);
    }

    #[test]
    fn grows_to_next_multiple() {
        let chunk = 4096 * 4;
        let size = per_cpu_buffer_size(4096, 4, chunk * 2 + 1);
        assert_eq!(size, chunk * 3);
    }

    #[test]
    fn zero_pages_is_treated_as_one() {
        assert_eq!(per_cpu_buffer_size(4096, 0, 16), 4096);
    }

    #[test]
    fn page_size_is_sane() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn eof_detected_through_source_chain() {
        #[derive(thiserror::Error, Debug)]
        #[error("wrapped")]
        struct Wrapped(#[source] io::Error);

        let err = Wrapped(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert!(is_end_of_stream(&err));

        let err = Wrapped(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!is_end_of_stream(&err));
    }

    #[tokio::test]
    async fn closer_wakes_waiters() {
        let closer = Closer::new();
        let other = closer.clone();
        let waiter = tokio::spawn(async move { other.closed().await });
        closer.close();
        waiter.await.unwrap();
        assert!(closer.is_closed());
    }
}

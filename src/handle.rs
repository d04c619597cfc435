//! Byte handle backends: an in-memory buffer and a temp-file on disk.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::contract::{ByteHandle, HandleFactory};

/// Payload held in memory. Cloning shares the same buffer.
#[derive(Clone, Default)]
pub struct MemoryHandle {
    contents: Arc<Mutex<Vec<u8>>>,
}

impl MemoryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct MemoryWriter {
    target: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ByteHandle for MemoryHandle {
    async fn writer(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(Box::new(MemoryWriter {
            target: Arc::clone(&self.contents),
        }))
    }

    async fn reader(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(Box::new(io::Cursor::new(self.contents())))
    }
}

/// Produces [`MemoryHandle`]s and remembers them so tests can inspect payloads.
#[derive(Clone, Default)]
pub struct MemoryHandleFactory {
    produced: Arc<Mutex<Vec<MemoryHandle>>>,
}

impl MemoryHandleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handle produced so far, in production order.
    pub fn produced(&self) -> Vec<MemoryHandle> {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HandleFactory for MemoryHandleFactory {
    fn produce(&self) -> Box<dyn ByteHandle> {
        let handle = MemoryHandle::new();
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        Box::new(handle)
    }
}

/// Payload spooled to a temp file, removed when the handle is dropped.
pub struct TempFileHandle {
    file: NamedTempFile,
}

impl TempFileHandle {
    pub fn new_in(dir: &Path) -> io::Result<Self> {
        let file = NamedTempFile::new_in(dir)?;
        debug!(path = %file.path().display(), "Created temp file handle");
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[async_trait]
impl ByteHandle for TempFileHandle {
    async fn writer(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let file = tokio::fs::File::create(self.file.path()).await?;
        Ok(Box::new(file))
    }

    async fn reader(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(self.file.path()).await?;
        Ok(Box::new(file))
    }
}

/// Handle that fails on open; stands in when a temp file cannot be created.
struct UnavailableHandle {
    reason: String,
}

#[async_trait]
impl ByteHandle for UnavailableHandle {
    async fn writer(&self) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        Err(io::Error::other(self.reason.clone()))
    }

    async fn reader(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        Err(io::Error::other(self.reason.clone()))
    }
}

/// Produces [`TempFileHandle`]s under one spool directory.
pub struct TempFileHandleFactory {
    dir: PathBuf,
}

impl TempFileHandleFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl HandleFactory for TempFileHandleFactory {
    fn produce(&self) -> Box<dyn ByteHandle> {
        match TempFileHandle::new_in(&self.dir) {
            Ok(handle) => Box::new(handle),
            // Fails on first write instead.
            Err(e) => Box::new(UnavailableHandle {
                reason: format!("failed to create temp file in {}: {e}", self.dir.display()),
            }),
        }
    }
}

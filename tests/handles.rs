use streamline_ingest::contract::{ByteHandle, HandleFactory};
use streamline_ingest::handle::{MemoryHandle, TempFileHandle, TempFileHandleFactory};
use tempfile::tempdir;
use tokio::io::AsyncReadExt;

async fn read_all(handle: &dyn ByteHandle) -> Vec<u8> {
    let mut buf = Vec::new();
    handle.reader().await.unwrap().read_to_end(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_memory_handle_write_replaces_contents() {
    let handle = MemoryHandle::new();
    handle.write(b"first payload").await.unwrap();
    handle.write(b"second").await.unwrap();
    assert_eq!(read_all(&handle).await, b"second");
    assert_eq!(handle.contents(), b"second");
}

#[tokio::test]
async fn test_temp_file_handle_round_trips_and_cleans_up() {
    let dir = tempdir().unwrap();
    let handle = TempFileHandle::new_in(dir.path()).unwrap();
    let path = handle.path().to_path_buf();

    handle.write(b"spooled to disk").await.unwrap();
    assert_eq!(read_all(&handle).await, b"spooled to disk");
    assert_eq!(std::fs::read(&path).unwrap(), b"spooled to disk");

    drop(handle);
    assert!(!path.exists(), "temp file removed with its handle");
}

#[tokio::test]
async fn test_temp_file_factory_in_missing_dir_fails_on_first_write() {
    let dir = tempdir().unwrap();
    let factory = TempFileHandleFactory::new(dir.path().join("missing"));
    let handle = factory.produce();
    assert!(handle.write(b"data").await.is_err());
}

#[tokio::test]
async fn test_closure_is_a_handle_factory() {
    let factory = || -> Box<dyn ByteHandle> { Box::new(MemoryHandle::new()) };
    let handle = factory.produce();
    handle.write(b"x").await.unwrap();
    assert_eq!(read_all(handle.as_ref()).await, b"x");
}

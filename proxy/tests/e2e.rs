//! End-to-end tests: a real file server and proxy on ephemeral ports,
//! driven by raw TCP clients speaking the syscall protocol.

use bytes::BytesMut;
use protocol_chunk::frame::{FrameDecoder, read_frame};
use protocol_chunk::syscall::{Request, Response};
use protocol_chunk::{CHUNK_SIZE, OpenOption, Whence, errno};
use proxy::CacheStore;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a listener to come up by polling the port.
fn wait_for_listener(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

/// A running server + proxy pair with their own directories.
struct TestEnv {
    server_root: TempDir,
    cache_dir: TempDir,
    proxy_addr: SocketAddr,
    store: Arc<CacheStore>,
    shutdown: Arc<AtomicBool>,
}

impl TestEnv {
    fn start(cache_size: u64) -> Self {
        let server_root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let server_port = get_available_port();
        let server_addr: SocketAddr = format!("127.0.0.1:{server_port}").parse().unwrap();
        let proxy_port = get_available_port();
        let proxy_addr: SocketAddr = format!("127.0.0.1:{proxy_port}").parse().unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));

        let server_config = server::Config {
            server: server::config::ServerConfig { listen: server_addr },
            storage: server::config::StorageConfig {
                root_dir: server_root.path().to_path_buf(),
            },
            logging: server::config::LoggingConfig::default(),
        };
        let files = Arc::new(server::ServerFiles::new(server_root.path()));
        {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let _ = server::run(&server_config, files, shutdown);
            });
        }
        assert!(
            wait_for_listener(server_addr, Duration::from_secs(5)),
            "server failed to start"
        );

        let proxy_config: proxy::Config = toml::from_str(&format!(
            r#"
            [proxy]
            listen = "127.0.0.1:{proxy_port}"

            [remote]
            host = "127.0.0.1"
            port = {server_port}

            [cache]
            dir = "{}"
            max_size_bytes = {cache_size}
            "#,
            cache_dir.path().display()
        ))
        .unwrap();
        let store = Arc::new(CacheStore::new(cache_size));
        {
            let store = store.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let _ = proxy::run(&proxy_config, store, shutdown);
            });
        }
        assert!(
            wait_for_listener(proxy_addr, Duration::from_secs(5)),
            "proxy failed to start"
        );

        Self {
            server_root,
            cache_dir,
            proxy_addr,
            store,
            shutdown,
        }
    }

    fn server_file(&self, name: &str) -> PathBuf {
        self.server_root.path().join(name)
    }

    fn cache_file(&self, name: &str) -> PathBuf {
        self.cache_dir.path().join(name)
    }

    fn client(&self) -> TestClient {
        TestClient::connect(self.proxy_addr)
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
    }
}

/// A raw syscall-protocol client.
struct TestClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    send_buf: BytesMut,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("failed to connect to proxy");
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(),
            send_buf: BytesMut::new(),
        }
    }

    fn request(&mut self, request: &Request) -> Response {
        self.send_buf.clear();
        request.encode(&mut self.send_buf);
        self.stream.write_all(&self.send_buf).unwrap();

        let payload = read_frame(&mut self.stream, &mut self.decoder)
            .unwrap()
            .expect("proxy closed connection");
        Response::parse(&payload).unwrap()
    }

    fn code(&mut self, request: &Request) -> i64 {
        match self.request(request) {
            Response::Code(code) => code,
            other => panic!("expected code response, got {other:?}"),
        }
    }

    fn open(&mut self, path: &str, option: OpenOption) -> i64 {
        self.code(&Request::Open {
            path: path.to_string(),
            option,
        })
    }

    fn close(&mut self, fd: u64) -> i64 {
        self.code(&Request::Close { fd })
    }

    fn read(&mut self, fd: u64, len: u32) -> (i64, Vec<u8>) {
        match self.request(&Request::Read { fd, len }) {
            Response::Data { code, data } => (code, data.to_vec()),
            other => panic!("expected data response, got {other:?}"),
        }
    }

    /// Read until EOF.
    fn read_all(&mut self, fd: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let (code, data) = self.read(fd, CHUNK_SIZE as u32);
            assert!(code >= 0, "read failed with {code}");
            if code == 0 {
                return out;
            }
            out.extend_from_slice(&data);
        }
    }

    fn write(&mut self, fd: u64, data: &[u8]) -> i64 {
        self.code(&Request::Write {
            fd,
            data: bytes::Bytes::copy_from_slice(data),
        })
    }

    /// Write all of `data`, one chunk-sized request at a time.
    fn write_all(&mut self, fd: u64, data: &[u8]) {
        for piece in data.chunks(CHUNK_SIZE) {
            assert_eq!(self.write(fd, piece), piece.len() as i64);
        }
    }

    fn lseek(&mut self, fd: u64, offset: i64, whence: Whence) -> i64 {
        self.code(&Request::Lseek { fd, offset, whence })
    }

    fn unlink(&mut self, path: &str) -> i64 {
        self.code(&Request::Unlink {
            path: path.to_string(),
        })
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_cold_read() {
    let env = TestEnv::start(1024 * 1024);
    let content = patterned(100 * 1024);
    std::fs::write(env.server_file("a.txt"), &content).unwrap();

    let mut client = env.client();
    let fd = client.open("a.txt", OpenOption::Read);
    assert!(fd >= 0);
    assert_eq!(client.read_all(fd as u64), content);
    assert_eq!(client.close(fd as u64), 0);

    // The file is cached at version 0, unpinned, fully accounted.
    let cache_path = env.cache_file("a.txt_v0");
    assert!(cache_path.exists());
    {
        let store = env.store.read();
        let entry = store.lookup(&cache_path).expect("entry should be cached");
        assert_eq!(entry.ref_count, 0);
        assert_eq!(entry.size_bytes, content.len() as u64);
        assert_eq!(entry.version, 0);
    }
    assert_eq!(env.store.current_size(), content.len() as u64);
    assert_eq!(env.store.read().len(), 1);
}

#[test]
fn test_cache_hit_serves_local_bytes() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("a.txt"), b"cached content").unwrap();

    let mut client = env.client();
    let fd = client.open("a.txt", OpenOption::Read);
    assert_eq!(client.read_all(fd as u64), b"cached content");
    client.close(fd as u64);

    // Mutate the server file behind the version map's back. A second open
    // probes the same version, hits the cache, and must not transfer
    // chunks - so it still sees the cached bytes.
    std::fs::write(env.server_file("a.txt"), b"changed on disk").unwrap();

    let mut second = env.client();
    let fd = second.open("a.txt", OpenOption::Read);
    assert_eq!(second.read_all(fd as u64), b"cached content");
    assert_eq!(second.close(fd as u64), 0);
}

#[test]
fn test_multi_chunk_transfer() {
    let env = TestEnv::start(8 * 1024 * 1024);
    let content = patterned(2 * CHUNK_SIZE + 4096);
    std::fs::write(env.server_file("big.bin"), &content).unwrap();

    let mut client = env.client();
    let fd = client.open("big.bin", OpenOption::Read);
    assert!(fd >= 0);
    assert_eq!(client.read_all(fd as u64), content);
    client.close(fd as u64);
}

#[test]
fn test_write_close_uploads_new_version() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("b.txt"), b"old contents").unwrap();

    let mut client = env.client();
    let fd = client.open("b.txt", OpenOption::Write);
    assert!(fd >= 0);
    client.write_all(fd as u64, b"new contents, longer than before");
    assert_eq!(client.close(fd as u64), 0);

    // The server took version 1; the cache promoted it and swept v0.
    assert_eq!(
        std::fs::read(env.server_file("b.txt")).unwrap(),
        b"new contents, longer than before"
    );
    assert!(env.store.contains(&env.cache_file("b.txt_v1")));
    assert!(!env.store.contains(&env.cache_file("b.txt_v0")));
    assert!(!env.cache_file("b.txt_v0").exists());

    // No leftover working copies.
    assert!(!env.cache_file("b.txt_v0_tmp").exists());

    // A reader sees the new version from cache (writer-to-reader
    // visibility on the same path).
    let mut reader = env.client();
    let fd = reader.open("b.txt", OpenOption::Read);
    assert_eq!(reader.read_all(fd as u64), b"new contents, longer than before");
    reader.close(fd as u64);
}

#[test]
fn test_partial_overwrite_keeps_working_copy_tail() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("t.txt"), patterned(10_000)).unwrap();

    let mut client = env.client();
    let fd = client.open("t.txt", OpenOption::Write);
    // Overwrite in place with something much shorter, then truncate by
    // uploading: the new version must not keep the old tail.
    assert_eq!(client.lseek(fd as u64, 0, Whence::FromStart), 0);
    client.write(fd as u64, b"tiny");
    client.close(fd as u64);

    // The writer's copy still had the old tail beyond offset 4; the
    // upload carries the whole working copy.
    let uploaded = std::fs::read(env.server_file("t.txt")).unwrap();
    assert_eq!(&uploaded[..4], b"tiny");
    assert_eq!(uploaded.len(), 10_000);
}

#[test]
fn test_concurrent_writers_last_writer_wins() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("c.txt"), b"base").unwrap();

    let mut first = env.client();
    let mut second = env.client();

    // Both writers fork their private copies from version 0.
    let fd1 = first.open("c.txt", OpenOption::Write);
    let fd2 = second.open("c.txt", OpenOption::Write);
    assert!(fd1 >= 0 && fd2 >= 0);

    first.write(fd1 as u64, b"X");
    second.write(fd2 as u64, b"Y");

    // First close publishes version 1, second version 2.
    assert_eq!(first.close(fd1 as u64), 0);
    let after_first = std::fs::read(env.server_file("c.txt")).unwrap();
    assert_eq!(&after_first[..1], b"X");

    assert_eq!(second.close(fd2 as u64), 0);
    let after_second = std::fs::read(env.server_file("c.txt")).unwrap();
    assert_eq!(&after_second[..1], b"Y");

    assert!(env.store.contains(&env.cache_file("c.txt_v2")));
}

#[test]
fn test_eviction_under_pin_allows_overflow() {
    let env = TestEnv::start(300 * 1024);
    std::fs::write(env.server_file("f1"), patterned(200 * 1024)).unwrap();
    std::fs::write(env.server_file("f2"), patterned(200 * 1024)).unwrap();
    std::fs::write(env.server_file("f3"), patterned(200 * 1024)).unwrap();

    let mut holder = env.client();
    let fd1 = holder.open("f1", OpenOption::Read);
    assert!(fd1 >= 0);

    // f1 is pinned: installing f2 cannot meet the budget but proceeds.
    let mut other = env.client();
    let fd2 = other.open("f2", OpenOption::Read);
    assert!(fd2 >= 0);
    assert!(env.store.contains(&env.cache_file("f1_v0")), "pinned entry survives");
    assert!(env.store.contains(&env.cache_file("f2_v0")));
    assert!(env.store.current_size() > 300 * 1024, "store runs over budget");
    other.close(fd2 as u64);

    // Once f1 unpins, the next open can evict back under budget.
    holder.close(fd1 as u64);
    let mut third = env.client();
    let fd3 = third.open("f3", OpenOption::Read);
    assert!(fd3 >= 0);
    assert!(env.store.contains(&env.cache_file("f3_v0")));
    third.close(fd3 as u64);
    assert!(
        env.store.current_size() <= 300 * 1024,
        "store back under budget after unpin"
    );
}

#[test]
fn test_unlink_then_open() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("g.txt"), b"doomed").unwrap();
    std::fs::create_dir(env.server_file("subdir")).unwrap();

    let mut client = env.client();
    assert_eq!(client.unlink("g.txt"), 0);
    assert!(!env.server_file("g.txt").exists());

    assert_eq!(
        client.open("g.txt", OpenOption::Read),
        errno::ENOENT as i64
    );
    assert_eq!(client.unlink("g.txt"), errno::ENOENT as i64);
    assert_eq!(client.unlink("subdir"), errno::EISDIR as i64);
}

#[test]
fn test_create_and_create_new() {
    let env = TestEnv::start(1024 * 1024);

    let mut client = env.client();
    let fd = client.open("made.txt", OpenOption::Create);
    assert!(fd >= 0);
    client.write(fd as u64, b"created");
    assert_eq!(client.close(fd as u64), 0);
    assert_eq!(std::fs::read(env.server_file("made.txt")).unwrap(), b"created");

    assert_eq!(
        client.open("made.txt", OpenOption::CreateNew),
        errno::EEXIST as i64
    );

    // CREATE on an existing file opens it read-write without truncating.
    let fd = client.open("made.txt", OpenOption::Create);
    assert!(fd >= 0);
    assert_eq!(client.read_all(fd as u64), b"created");
    client.close(fd as u64);
}

#[test]
fn test_directory_sentinel() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::create_dir(env.server_file("adir")).unwrap();

    let mut client = env.client();
    let fd = client.open("adir", OpenOption::Read);
    assert!(fd >= 0, "directory read-open yields a descriptor");

    let (code, _) = client.read(fd as u64, 16);
    assert_eq!(code, errno::EISDIR as i64);
    assert_eq!(
        client.lseek(fd as u64, 0, Whence::FromStart),
        errno::EBADF as i64
    );
    assert_eq!(client.write(fd as u64, b"x"), errno::EBADF as i64);
    assert_eq!(client.close(fd as u64), 0);

    // Writes to a directory are refused at open.
    assert_eq!(
        client.open("adir", OpenOption::Write),
        errno::EISDIR as i64
    );
}

#[test]
fn test_lseek_semantics() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("s.txt"), b"0123456789").unwrap();

    let mut client = env.client();
    let fd = client.open("s.txt", OpenOption::Read) as u64;

    assert_eq!(client.lseek(fd, -1, Whence::FromStart), errno::EINVAL as i64);
    assert_eq!(client.lseek(fd, 1, Whence::FromEnd), errno::EINVAL as i64);
    assert_eq!(client.lseek(fd, -100, Whence::FromCurrent), errno::EINVAL as i64);

    assert_eq!(client.lseek(fd, 4, Whence::FromStart), 4);
    let (n, data) = client.read(fd, 3);
    assert_eq!((n, data.as_slice()), (3, &b"456"[..]));

    assert_eq!(client.lseek(fd, -3, Whence::FromEnd), 7);
    let (n, data) = client.read(fd, 16);
    assert_eq!((n, data.as_slice()), (3, &b"789"[..]));

    assert_eq!(client.lseek(fd, -2, Whence::FromCurrent), 8);
    let (n, data) = client.read(fd, 1);
    assert_eq!((n, data.as_slice()), (1, &b"8"[..]));

    client.close(fd);
}

#[test]
fn test_descriptor_errors() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("r.txt"), b"read only").unwrap();

    let mut client = env.client();
    assert_eq!(client.close(99), errno::EBADF as i64);
    let (code, _) = client.read(99, 4);
    assert_eq!(code, errno::EBADF as i64);

    let fd = client.open("r.txt", OpenOption::Read) as u64;
    assert_eq!(client.write(fd, b"nope"), errno::EBADF as i64);
    client.close(fd);

    assert_eq!(
        client.open("missing.txt", OpenOption::Read),
        errno::ENOENT as i64
    );
    assert_eq!(
        client.open("missing.txt", OpenOption::Write),
        errno::ENOENT as i64
    );
}

#[test]
fn test_sparse_write_via_lseek_roundtrip() {
    let env = TestEnv::start(1024 * 1024);

    let mut writer = env.client();
    let fd = writer.open("sparse.bin", OpenOption::Create) as u64;
    writer.write(fd, b"head");
    assert_eq!(writer.lseek(fd, 100, Whence::FromStart), 100);
    writer.write(fd, b"tail");
    assert_eq!(writer.close(fd), 0);

    let mut reader = env.client();
    let fd = reader.open("sparse.bin", OpenOption::Read) as u64;
    let bytes = reader.read_all(fd);
    reader.close(fd);

    assert_eq!(bytes.len(), 104);
    assert_eq!(&bytes[..4], b"head");
    assert_eq!(&bytes[100..], b"tail");
    assert!(bytes[4..100].iter().all(|&b| b == 0));
}

#[test]
fn test_multi_chunk_upload() {
    let env = TestEnv::start(8 * 1024 * 1024);
    let content = patterned(2 * CHUNK_SIZE + 999);

    let mut writer = env.client();
    let fd = writer.open("upload.bin", OpenOption::Create) as u64;
    writer.write_all(fd, &content);
    assert_eq!(writer.close(fd), 0);

    assert_eq!(std::fs::read(env.server_file("upload.bin")).unwrap(), content);
}

#[test]
fn test_abandoned_writer_releases_footprint() {
    let env = TestEnv::start(1024 * 1024);
    std::fs::write(env.server_file("w.txt"), patterned(1000)).unwrap();

    let mut client = env.client();
    let fd = client.open("w.txt", OpenOption::Write) as u64;
    // The fork charged the working copy against the budget.
    assert_eq!(env.store.current_size(), 2000);

    // Closing without writing discards the copy, uploads nothing, bumps
    // nothing.
    assert_eq!(client.close(fd), 0);
    assert_eq!(env.store.current_size(), 1000);
    assert!(!env.store.contains(&env.cache_file("w.txt_v1")));
    assert_eq!(std::fs::read(env.server_file("w.txt")).unwrap(), patterned(1000));
}

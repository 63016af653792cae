//! Client-facing front: accepts connections and routes operations.
//!
//! One worker thread per client, blocking I/O. Each client gets a private
//! [`SessionManager`] with its own RPC connection to the file server; the
//! [`CacheStore`] is the only shared state. A client's operations are
//! serialized by construction; cross-client ordering comes from the store
//! lock.

use crate::cache::CacheStore;
use crate::config::Config;
use crate::metrics::{CLIENT_CONNECTIONS, SYSCALL_OPS};
use crate::path::CachePaths;
use crate::rpc::RpcClient;
use crate::session::SessionManager;
use bytes::BytesMut;
use protocol_chunk::CHUNK_SIZE;
use protocol_chunk::frame::{FrameDecoder, read_frame};
use protocol_chunk::syscall::{Request, Response};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Run the proxy front until the shutdown flag is set.
pub fn run(
    config: &Config,
    store: Arc<CacheStore>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(config.proxy.listen)?;
    listener.set_nonblocking(true)?;

    let remote = config.remote.addr()?;
    info!(
        listen = %config.proxy.listen,
        server = %remote,
        cache_dir = %config.cache.dir.display(),
        cache_size = config.cache.max_size_bytes,
        "proxy started"
    );

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(client = %addr, error = %e, "failed to configure client socket");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                CLIENT_CONNECTIONS.increment();
                debug!(client = %addr, "client connected");

                let store = Arc::clone(&store);
                let cache_dir = config.cache.dir.clone();
                thread::spawn(move || {
                    handle_client(stream, addr, store, cache_dir, remote);
                    CLIENT_CONNECTIONS.decrement();
                    debug!(client = %addr, "client disconnected");
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }

    info!("proxy shutting down");
    Ok(())
}

/// Serve one client until it sends `ClientDone` or drops the connection.
fn handle_client(
    mut stream: TcpStream,
    addr: SocketAddr,
    store: Arc<CacheStore>,
    cache_dir: PathBuf,
    remote: SocketAddr,
) {
    let rpc = match RpcClient::connect(remote) {
        Ok(rpc) => rpc,
        Err(e) => {
            error!(client = %addr, error = %e, "cannot reach file server");
            return;
        }
    };
    let mut session = SessionManager::new(store, CachePaths::new(cache_dir), rpc);

    let mut decoder = FrameDecoder::new();
    let mut send_buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let payload = match read_frame(&mut stream, &mut decoder) {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                if !is_connection_reset(&e) {
                    warn!(client = %addr, error = %e, "client read failed");
                }
                break;
            }
        };

        let request = match Request::parse(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(client = %addr, error = %e, "bad request");
                break;
            }
        };

        SYSCALL_OPS.increment();
        let done = matches!(request, Request::ClientDone);
        let response = dispatch(&mut session, request);

        send_buf.clear();
        response.encode(&mut send_buf);
        if let Err(e) = stream.write_all(&send_buf) {
            if !is_connection_reset(&e) {
                warn!(client = %addr, error = %e, "client write failed");
            }
            break;
        }

        if done {
            break;
        }
    }

    session.client_done();
}

/// Route one request to the session.
fn dispatch(session: &mut SessionManager, request: Request) -> Response {
    match request {
        Request::Open { path, option } => Response::Code(session.open(&path, option)),
        Request::Close { fd } => Response::Code(session.close(fd)),
        Request::Read { fd, len } => {
            let mut buf = vec![0u8; (len as usize).min(CHUNK_SIZE)];
            let code = session.read(fd, &mut buf);
            if code >= 0 {
                buf.truncate(code as usize);
                Response::Data {
                    code,
                    data: buf.into(),
                }
            } else {
                Response::Data {
                    code,
                    data: bytes::Bytes::new(),
                }
            }
        }
        Request::Write { fd, data } => Response::Code(session.write(fd, &data)),
        Request::Lseek { fd, offset, whence } => Response::Code(session.lseek(fd, offset, whence)),
        Request::Unlink { path } => Response::Code(session.unlink(&path)),
        Request::ClientDone => {
            session.client_done();
            Response::Code(0)
        }
    }
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

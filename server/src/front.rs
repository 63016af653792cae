//! Accept loop and RPC dispatch.
//!
//! One thread per proxy connection, blocking I/O, all sharing the
//! [`ServerFiles`] store.

use crate::config::Config;
use crate::files::ServerFiles;
use crate::metrics::{CONNECTIONS, RPC_REQUESTS};
use bytes::BytesMut;
use protocol_chunk::frame::{FrameDecoder, read_frame};
use protocol_chunk::rpc::{Request, Response};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run the file server until the shutdown flag is set.
pub fn run(
    config: &Config,
    files: Arc<ServerFiles>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(config.server.listen)?;
    listener.set_nonblocking(true)?;

    info!(
        listen = %config.server.listen,
        root = %files.root().display(),
        "server started"
    );

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(peer = %addr, error = %e, "failed to configure socket");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                CONNECTIONS.increment();
                debug!(peer = %addr, "proxy connected");

                let files = Arc::clone(&files);
                thread::spawn(move || {
                    handle_connection(stream, addr, files);
                    CONNECTIONS.decrement();
                    debug!(peer = %addr, "proxy disconnected");
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

    info!("server shutting down");
    Ok(())
}

/// Serve one proxy connection until it drops.
fn handle_connection(mut stream: TcpStream, addr: SocketAddr, files: Arc<ServerFiles>) {
    let mut decoder = FrameDecoder::new();
    let mut send_buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let payload = match read_frame(&mut stream, &mut decoder) {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                if !is_connection_reset(&e) {
                    warn!(peer = %addr, error = %e, "read failed");
                }
                break;
            }
        };

        let request = match Request::parse(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %addr, error = %e, "bad request");
                break;
            }
        };

        RPC_REQUESTS.increment();
        let response = dispatch(&files, request);

        send_buf.clear();
        response.encode(&mut send_buf);
        if let Err(e) = stream.write_all(&send_buf) {
            if !is_connection_reset(&e) {
                warn!(peer = %addr, error = %e, "write failed");
            }
            break;
        }
    }
}

/// Route one request to the file store.
fn dispatch(files: &ServerFiles, request: Request) -> Response {
    match request {
        Request::DownloadChunk {
            path,
            chunk_num,
            option,
            is_probe,
        } => Response::Chunk(files.download_chunk(&path, chunk_num, option, is_probe)),
        Request::UploadChunk {
            path,
            version,
            chunk_num,
            is_last,
            data,
        } => Response::Bool(files.upload_chunk(&path, version, chunk_num, is_last, &data)),
        Request::StatExists { path } => Response::Bool(files.exists(&path)),
        Request::StatIsDir { path } => Response::Bool(files.is_dir(&path)),
        Request::StatVersion { path } => Response::Version(files.version(&path)),
        Request::Delete { path } => Response::Bool(files.delete(&path)),
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

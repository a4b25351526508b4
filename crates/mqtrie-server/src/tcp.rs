//! TCP accept loop and live-connection registry.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use crossbeam_utils::sync::WaitGroup;
use dashmap::DashMap;
use log::{debug, error, info};

use crate::conn::Conn;
use crate::server::Shared;

/// How often a quiet accept loop re-checks the shutdown signal.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tracks live connections and runs their I/O loops.
pub struct TcpServer {
    shared: Arc<Shared>,
    conns: DashMap<u64, Arc<Conn>>,
}

impl TcpServer {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            conns: DashMap::new(),
        }
    }

    /// Wrap an accepted socket as a connection, register it, and run its
    /// I/O loop to completion.
    pub fn handle(&self, socket: TcpStream, remote_addr: SocketAddr) {
        debug!("TCP: new client {}", remote_addr);

        let conn = match Conn::new(Arc::clone(&self.shared), socket, remote_addr) {
            Ok(conn) => conn,
            Err(e) => {
                error!("TCP: connection setup for {} failed: {}", remote_addr, e);
                return;
            }
        };

        self.conns.insert(conn.luid(), Arc::clone(&conn));
        if let Err(e) = conn.io_loop() {
            debug!("TCP: client {} ({}): {}", conn.luid(), remote_addr, e);
        }
        self.conns.remove(&conn.luid());
        self.shared.decr_conn_count();
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        for entry in self.conns.iter() {
            entry.value().close();
        }
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }
}

/// Accept connections until shutdown, spawning one handler thread per
/// client. Returns once every handler has finished.
pub fn serve(
    listener: TcpListener,
    tcp_server: Arc<TcpServer>,
    shutdown_rx: Receiver<()>,
) -> io::Result<()> {
    info!("TCP server listening on {}", listener.local_addr()?);
    listener.set_nonblocking(true)?;

    let wg = WaitGroup::new();

    loop {
        match listener.accept() {
            Ok((socket, remote_addr)) => {
                socket.set_nonblocking(false)?;
                let tcp_server = Arc::clone(&tcp_server);
                let wg = wg.clone();
                thread::Builder::new()
                    .name(format!("mqtrie-conn-{}", remote_addr))
                    .spawn(move || {
                        tcp_server.handle(socket, remote_addr);
                        drop(wg);
                    })?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                match shutdown_rx.recv_timeout(ACCEPT_POLL_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {}
                    // Sender dropped: graceful shutdown.
                    _ => break,
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                thread::yield_now();
            }
            Err(e) => {
                error!("TCP server accept error: {}", e);
                return Err(e);
            }
        }
    }

    // Wait until all handler threads have finished.
    wg.wait();
    info!("TCP server closing");
    Ok(())
}

//! `mio`-driven, non-blocking network receive loop.
//!
//! `spec.md` treats the transport as an external collaborator — this
//! module is the thinnest thing that can plausibly own a socket and feed
//! [`IncomingMsgsStorage`] without speculating about a wire protocol this
//! spec never defines. Frames are exchanged as single UDP datagrams
//! (each replica-to-replica message fits comfortably under typical MTU
//! budgets once batched payloads are capped at `MAX_BATCH_SIZE`),
//! avoiding the connection-accept/backlog machinery a TCP transport
//! would need for something out of scope here.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use quorate_core::RawFrame;

use crate::incoming_queue::{IncomingMsgsStorage, PushResult};

const SOCKET_TOKEN: Token = Token(0);
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Owns the bound socket and drives the `mio` poll loop on its own
/// thread, pushing decoded [`RawFrame`]s into a shared
/// [`IncomingMsgsStorage`] until told to stop.
pub struct ReceiveLoop {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ReceiveLoop {
    /// Binds `addr` and spawns the receive thread.
    pub fn spawn(addr: SocketAddr, inbox: Arc<IncomingMsgsStorage>) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("quorate-recv".to_string())
            .spawn(move || Self::run(socket, poll, inbox, thread_shutdown))
            .expect("failed to spawn receive thread");

        tracing::info!(%addr, "receive loop listening");
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    fn run(socket: UdpSocket, mut poll: Poll, inbox: Arc<IncomingMsgsStorage>, shutdown: Arc<AtomicBool>) {
        let mut events = Events::with_capacity(128);
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(err) = poll.poll(&mut events, Some(std::time::Duration::from_millis(100))) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %err, "mio poll failed");
                break;
            }

            for event in &events {
                if event.token() != SOCKET_TOKEN {
                    continue;
                }
                loop {
                    match socket.recv_from(&mut buf) {
                        Ok((len, from)) => {
                            Self::ingest(&inbox, &buf[..len], from);
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            tracing::warn!(error = %err, "recv_from failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn ingest(inbox: &IncomingMsgsStorage, datagram: &[u8], from: SocketAddr) {
        let frame = match RawFrame::sniff(datagram.to_vec()) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(%from, error = %err, "dropped malformed datagram");
                return;
            }
        };
        if let PushResult::Backpressure(_) = inbox.try_push(frame) {
            tracing::warn!(%from, "incoming queue full, dropping frame");
        }
    }

    /// Signals the receive thread to stop and waits for it to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! The multiplex loop: a single task that owns the listener and the
//! [`Registry`], waits for readiness on every interesting handle, and
//! dispatches accept, receive, and broadcast work between waits.
//!
//! All socket calls made outside the wait are bounded and non-blocking
//! (`try_read` / `try_write` against handles the readiness wait reported),
//! so the loop never stalls on one peer. The registry is mutated only
//! between waits, on this task, which is why it needs no locking.

use std::{future::Future, io, net::SocketAddr};

use anyhow::Result;
use futures::{
    future::{pending, select_all},
    FutureExt,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader, Interest},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Default number of simultaneously connected peers.
pub const DEFAULT_CAPACITY: usize = 10;

/// One receive call reads at most this many bytes; whatever a single read
/// returns is relayed verbatim as one message. Larger or segment-split
/// messages arrive fragmented, which is an accepted property of the
/// frameless protocol.
const RECV_BUFFER_SIZE: usize = 256;

/// The only recognized control directive. Case-sensitive, surrounding
/// whitespace ignored; anything else on the control input is ignored.
const QUIT_DIRECTIVE: &str = "quit";

/// A relay server: one listener plus the slot table of connected peers.
///
/// The relay and every socket inside it are owned by whichever task calls
/// [`Relay::run`]; nothing is shared or handed to other tasks.
pub struct Relay {
    listener: TcpListener,
    registry: Registry<TcpStream>,
}

/// What the readiness wait reported, captured so the borrow of the registry
/// taken by the wait ends before dispatch mutates it.
enum Event {
    Shutdown,
    Control(io::Result<usize>),
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Readable(Vec<(usize, io::Result<()>)>),
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_capacity(listener, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(listener: TcpListener, capacity: usize) -> Self {
        Self {
            listener,
            registry: Registry::new(capacity),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until the `quit` directive arrives on the process's stdin or
    /// ctrl-c is received. Both paths go through the same teardown.
    pub async fn run(self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        self.run_until(stdin, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// Runs the multiplex loop until the `quit` directive is read from
    /// `control` or `shutdown` completes.
    ///
    /// Every iteration rebuilds the readiness set from the current registry
    /// state plus the listener and the control input, blocks until something
    /// is ready, and dispatches. Every client slot reported readable is
    /// serviced in slot order before the next wait, so one chatty peer
    /// cannot starve the others. Accept errors and errors from the shared
    /// wait are logged and the loop continues; a readiness error scoped to
    /// one peer's socket is treated as a per-connection failure and releases
    /// only that slot. Only startup failures (before this method is called)
    /// are fatal. On return, the listener and every connected peer have been
    /// closed.
    pub async fn run_until<C, F>(self, control: C, shutdown: F) -> Result<()>
    where
        C: AsyncBufRead + Unpin,
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            mut registry,
        } = self;
        let mut control = control;
        let mut control_open = true;
        let mut directive = String::new();
        tokio::pin!(shutdown);

        loop {
            directive.clear();
            let event = {
                let readable = next_readable(&registry);
                tokio::pin!(readable);
                // Biased so ready sources dispatch in a fixed order:
                // shutdown, control input, listener, then client sockets.
                select! {
                    biased;
                    _ = &mut shutdown => Event::Shutdown,
                    read = next_directive(&mut control, &mut directive, control_open) => {
                        Event::Control(read)
                    }
                    accepted = listener.accept() => Event::Accept(accepted),
                    ready = &mut readable => Event::Readable(ready),
                }
            };

            match event {
                Event::Shutdown => {
                    info!("external shutdown requested");
                    break;
                }
                Event::Control(Ok(0)) => {
                    debug!("control input closed; serving until external shutdown");
                    control_open = false;
                }
                Event::Control(Ok(_)) => {
                    if directive.trim() == QUIT_DIRECTIVE {
                        info!("quit directive received");
                        break;
                    }
                    debug!(input = directive.trim_end(), "ignoring control input");
                }
                Event::Control(Err(err)) => {
                    warn!(error = ?err, "control input failed; serving until external shutdown");
                    control_open = false;
                }
                Event::Accept(Ok((stream, peer))) => admit(&mut registry, stream, peer),
                Event::Accept(Err(err)) => warn!(error = ?err, "failed to accept connection"),
                Event::Readable(ready) => {
                    for (slot, readiness) in ready {
                        match readiness {
                            Ok(()) => receive_and_relay(&mut registry, slot),
                            Err(err) => {
                                warn!(slot, error = ?err, "readiness wait failed for peer");
                                drop_slot(&mut registry, slot);
                            }
                        }
                    }
                }
            }
        }

        teardown(listener, &mut registry);
        Ok(())
    }
}

/// Reads one line from the control input, or parks forever once the input
/// has closed so a dead control channel cannot spin the loop.
async fn next_directive<C>(control: &mut C, line: &mut String, open: bool) -> io::Result<usize>
where
    C: AsyncBufRead + Unpin,
{
    if open {
        control.read_line(line).await
    } else {
        pending().await
    }
}

/// Resolves with every occupied slot whose socket is readable, in slot
/// order. Waking on the first ready socket and then harvesting the rest
/// keeps dispatch fair: a peer that is always readable cannot keep a
/// higher-numbered slot from being serviced. With no peers connected this
/// pends forever, leaving the wait to the listener and control branches.
async fn next_readable(registry: &Registry<TcpStream>) -> Vec<(usize, io::Result<()>)> {
    let waits: Vec<_> = registry
        .occupied()
        .map(|(slot, stream)| {
            Box::pin(async move {
                let readiness = stream.ready(Interest::READABLE).await.map(|_| ());
                (slot, readiness)
            })
        })
        .collect();

    if waits.is_empty() {
        return pending().await;
    }

    let (first, _, rest) = select_all(waits).await;
    let mut ready: Vec<_> = rest
        .into_iter()
        .filter_map(|wait| wait.now_or_never())
        .collect();
    ready.push(first);
    ready.sort_by_key(|(slot, _)| *slot);
    ready
}

/// Assigns an accepted connection to the first free slot, or closes it
/// immediately when the registry is full. Nothing is written to a rejected
/// peer; dropping the stream closes the socket.
fn admit(registry: &mut Registry<TcpStream>, stream: TcpStream, peer: SocketAddr) {
    match registry.find_free_slot() {
        Some(slot) => {
            registry.assign(slot, stream);
            info!(%peer, slot, "peer connected");
        }
        None => {
            warn!(%peer, "registry full; rejecting connection");
        }
    }
}

/// One bounded receive on a slot the wait reported readable. A zero-length
/// read or a receive error drops only this peer; a payload is broadcast to
/// everyone else.
fn receive_and_relay(registry: &mut Registry<TcpStream>, slot: usize) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    let received = match registry.get(slot) {
        Some(stream) => stream.try_read(&mut buffer),
        None => return,
    };

    match received {
        Ok(0) => {
            info!(slot, "peer disconnected");
            drop_slot(registry, slot);
        }
        Ok(len) => {
            debug!(slot, len, "relaying message");
            broadcast(registry, slot, &buffer[..len]);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            // Stale readiness; the next wait will sort it out.
        }
        Err(err) => {
            warn!(slot, error = ?err, "receive failed");
            drop_slot(registry, slot);
        }
    }
}

/// Relays `payload` to every occupied slot except the sender, in slot order.
///
/// Delivery is best-effort: one bounded write per recipient. A failed
/// recipient is dropped and the iteration moves on, so one dead peer never
/// starves the rest. Short writes and not-ready recipients are logged as
/// partial delivery and not retried.
fn broadcast(registry: &mut Registry<TcpStream>, sender: usize, payload: &[u8]) {
    for slot in registry.occupied_indices() {
        if slot == sender {
            continue;
        }
        let Some(stream) = registry.get(slot) else {
            continue;
        };
        match stream.try_write(payload) {
            Ok(written) if written < payload.len() => {
                warn!(
                    slot,
                    written,
                    expected = payload.len(),
                    "partial delivery; remainder dropped"
                );
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                warn!(slot, "recipient not ready for writing; message dropped");
            }
            Err(err) => {
                warn!(slot, error = ?err, "send failed; dropping recipient");
                drop_slot(registry, slot);
            }
        }
    }
}

fn drop_slot(registry: &mut Registry<TcpStream>, slot: usize) {
    // Dropping the stream closes the socket.
    let _ = registry.release(slot);
}

/// Single teardown path used by both the quit directive and external
/// shutdown: the listener closes first, then every occupied slot in slot
/// order.
fn teardown(listener: TcpListener, registry: &mut Registry<TcpStream>) {
    info!("shutting down");
    drop(listener);
    for slot in registry.occupied_indices() {
        drop_slot(registry, slot);
    }
    info!("all connections closed");
}

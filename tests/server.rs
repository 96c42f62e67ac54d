use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use tcp_relay::server::Relay;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Long enough for the relay to work through its pending accepts and reads
/// on loopback.
const QUIET_PERIOD: Duration = Duration::from_millis(200);

struct RelayHandle {
    addr: SocketAddr,
    control: DuplexStream,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

async fn start_relay(capacity: usize) -> Result<RelayHandle> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let relay = Relay::with_capacity(listener, capacity);

    let (control, control_rx) = tokio::io::duplex(64);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = relay.run_until(BufReader::new(control_rx), shutdown).await;
    });

    Ok(RelayHandle {
        addr,
        control,
        shutdown: Some(shutdown_tx),
        server,
    })
}

impl RelayHandle {
    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.server.await;
    }
}

async fn read_chunk(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = [0u8; 256];
    let len = timeout(READ_TIMEOUT, stream.read(&mut buf)).await??;
    Ok(buf[..len].to_vec())
}

async fn assert_no_data(stream: &mut TcpStream, who: &str) {
    let mut buf = [0u8; 256];
    let got = timeout(QUIET_PERIOD, stream.read(&mut buf)).await;
    assert!(got.is_err(), "{who} unexpectedly received data");
}

#[tokio::test]
async fn relays_to_every_other_peer_but_not_the_sender() -> Result<()> {
    let relay = start_relay(10).await?;
    let mut alice = TcpStream::connect(relay.addr).await?;
    let mut bob = TcpStream::connect(relay.addr).await?;
    let mut carol = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;

    alice.write_all(b"hello").await?;

    assert_eq!(read_chunk(&mut bob).await?, b"hello");
    assert_eq!(read_chunk(&mut carol).await?, b"hello");
    assert_no_data(&mut alice, "alice").await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn refuses_connections_beyond_capacity() -> Result<()> {
    let relay = start_relay(2).await?;
    let mut first = TcpStream::connect(relay.addr).await?;
    let mut second = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;

    // The third connection completes the TCP handshake but the relay closes
    // it without writing anything.
    let mut third = TcpStream::connect(relay.addr).await?;
    let mut buf = [0u8; 8];
    let len = timeout(READ_TIMEOUT, third.read(&mut buf)).await??;
    assert_eq!(len, 0, "over-capacity connection should see EOF");

    // The admitted peers are unaffected.
    first.write_all(b"ping").await?;
    assert_eq!(read_chunk(&mut second).await?, b"ping");

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn released_slot_is_reusable_after_disconnect() -> Result<()> {
    let relay = start_relay(2).await?;
    let alice = TcpStream::connect(relay.addr).await?;
    let mut bob = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;

    drop(alice);
    sleep(QUIET_PERIOD).await;

    // The disconnect itself must not be broadcast as an empty message.
    assert_no_data(&mut bob, "bob").await;

    // Alice's slot is free again, so a new peer fits under the capacity of 2.
    let mut carol = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;
    bob.write_all(b"welcome").await?;
    assert_eq!(read_chunk(&mut carol).await?, b"welcome");

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn hello_scenario_end_to_end() -> Result<()> {
    let relay = start_relay(10).await?;
    let mut alice = TcpStream::connect(relay.addr).await?;
    let mut bob = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;

    alice.write_all(b"hello").await?;
    assert_eq!(read_chunk(&mut bob).await?, b"hello");
    assert_no_data(&mut alice, "alice").await;

    drop(alice);
    sleep(QUIET_PERIOD).await;

    // Bob's send goes nowhere but must not surface an error to bob.
    bob.write_all(b"anyone there?").await?;
    assert_no_data(&mut bob, "bob").await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn flooding_peer_does_not_starve_others() -> Result<()> {
    let relay = start_relay(10).await?;
    let mut flooder = TcpStream::connect(relay.addr).await?;
    let mut quiet = TcpStream::connect(relay.addr).await?;
    let mut observer = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;

    // Keep the first slot readable for the whole test while the second
    // slot says a single word.
    let flood = tokio::spawn(async move {
        let chunk = [0x41u8; 256];
        while flooder.write_all(&chunk).await.is_ok() {
            tokio::task::yield_now().await;
        }
    });
    sleep(Duration::from_millis(50)).await;
    quiet.write_all(b"ping").await?;

    // The observer sees flood bytes and, interleaved among them, the quiet
    // peer's message.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut seen_quiet_bytes = false;
    let mut buf = [0u8; 1024];
    while tokio::time::Instant::now() < deadline && !seen_quiet_bytes {
        let len = timeout(READ_TIMEOUT, observer.read(&mut buf)).await??;
        if len == 0 {
            break;
        }
        seen_quiet_bytes = buf[..len].iter().any(|byte| *byte != 0x41);
    }
    assert!(
        seen_quiet_bytes,
        "quiet peer's message was never relayed during the flood"
    );

    flood.abort();
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn quit_directive_tolerates_surrounding_whitespace() -> Result<()> {
    let mut relay = start_relay(4).await?;
    let mut alice = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;

    // The directive stays case-sensitive; only whitespace padding is
    // forgiven.
    relay.control.write_all(b"QUIT\n").await?;
    sleep(QUIET_PERIOD).await;
    assert!(
        !relay.server.is_finished(),
        "case-mismatched directive stopped the relay"
    );

    relay.control.write_all(b"  quit \n").await?;
    timeout(READ_TIMEOUT, &mut relay.server).await??;

    let mut buf = [0u8; 8];
    let len = timeout(READ_TIMEOUT, alice.read(&mut buf)).await??;
    assert_eq!(len, 0, "alice should see EOF after shutdown");

    Ok(())
}

#[tokio::test]
async fn quit_directive_closes_listener_and_peers() -> Result<()> {
    let mut relay = start_relay(10).await?;
    let mut alice = TcpStream::connect(relay.addr).await?;
    let mut bob = TcpStream::connect(relay.addr).await?;
    sleep(QUIET_PERIOD).await;

    // Unrecognized control input is ignored; the relay keeps serving.
    relay.control.write_all(b"status\n").await?;
    sleep(QUIET_PERIOD).await;
    alice.write_all(b"ping").await?;
    assert_eq!(read_chunk(&mut bob).await?, b"ping");

    relay.control.write_all(b"quit\n").await?;
    timeout(READ_TIMEOUT, &mut relay.server).await??;

    let mut buf = [0u8; 8];
    let len = timeout(READ_TIMEOUT, alice.read(&mut buf)).await??;
    assert_eq!(len, 0, "alice should see EOF after shutdown");
    let len = timeout(READ_TIMEOUT, bob.read(&mut buf)).await??;
    assert_eq!(len, 0, "bob should see EOF after shutdown");

    Ok(())
}

//! Interactive relay client: lines typed on stdin are sent to the server as
//! raw bytes, and whatever other peers send is printed as it arrives. The
//! relay adds no framing, so a printed chunk is whatever one read returned.

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

const RECV_BUFFER_SIZE: usize = 256;

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut incoming = [0u8; RECV_BUFFER_SIZE];

    loop {
        input.clear();
        select! {
            received = reader.read(&mut incoming) => {
                match received? {
                    0 => {
                        write_stdout("*** server closed the connection").await?;
                        break;
                    }
                    len => render_incoming(&incoming[..len]).await?,
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, &mut writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }

    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    writer.write_all(text.as_bytes()).await?;
    Ok(true)
}

async fn render_incoming(payload: &[u8]) -> io::Result<()> {
    write_stdout(&String::from_utf8_lossy(payload)).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

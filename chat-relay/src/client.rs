use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, handler::DEFAULT_MAX_CHUNK};

/// Pipes stdin to the relay and relay output to stdout, byte for byte.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut stdout).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(stream.into_split())
}

async fn run_client_loop<R, W, I, O>(
    reader: &mut R,
    writer: &mut W,
    stdin: &mut I,
    stdout: &mut O,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut from_server = vec![0u8; DEFAULT_MAX_CHUNK];
    let mut from_stdin = vec![0u8; DEFAULT_MAX_CHUNK];

    loop {
        select! {
            received = reader.read(&mut from_server) => {
                if !forward_chunk(received, &from_server, stdout).await.context("relay -> stdout")? {
                    info!("relay closed the connection");
                    break;
                }
            }
            typed = stdin.read(&mut from_stdin) => {
                if !forward_chunk(typed, &from_stdin, writer).await.context("stdin -> relay")? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

/// Copies one chunk to `sink`; `Ok(false)` once the source reached EOF.
async fn forward_chunk<O>(read: io::Result<usize>, buf: &[u8], sink: &mut O) -> io::Result<bool>
where
    O: AsyncWrite + Unpin,
{
    let len = read?;
    if len == 0 {
        return Ok(false);
    }
    sink.write_all(&buf[..len]).await?;
    sink.flush().await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gk_metrics::ProxyMetrics;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionTable;

const LENGTH_PREFIX_BYTES: usize = 4;
/// Commands are at most 9 bytes; anything claiming more than this is not a
/// controller talking to us.
const MAX_COMMAND_BYTES: usize = 1024;

const RESET_PAYLOAD: &[u8] = b"reset";
const PLAYER_COMMAND_BYTES: usize = 9;
const OP_ADMIT: u8 = b'a';
const OP_REVOKE: u8 = b'r';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Reset,
    Admit { player_id: u32, address: Ipv4Addr },
    Revoke { player_id: u32, address: Ipv4Addr },
}

#[derive(Debug, Error)]
pub enum FrameReadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("command length {declared_bytes} exceeds max {max_command_bytes}")]
    Oversized {
        declared_bytes: usize,
        max_command_bytes: usize,
    },
    #[error("connection closed mid-frame")]
    Incomplete,
}

/// Decodes one command payload. Unknown shapes yield `None` and are dropped
/// without closing the listener.
pub fn parse_command(payload: &[u8]) -> Option<ControlCommand> {
    if payload == RESET_PAYLOAD {
        return Some(ControlCommand::Reset);
    }
    if payload.len() != PLAYER_COMMAND_BYTES {
        return None;
    }

    let player_id = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    // Wire order is network order: the first address byte is the first octet.
    let address = Ipv4Addr::new(payload[5], payload[6], payload[7], payload[8]);

    match payload[0] {
        OP_ADMIT => Some(ControlCommand::Admit { player_id, address }),
        OP_REVOKE => Some(ControlCommand::Revoke { player_id, address }),
        _ => None,
    }
}

/// Reads one `u32 LE length || payload` frame. `Ok(None)` on a connection
/// closed before any length byte; a close mid-frame is `Incomplete` and the
/// partially read command is never applied.
pub async fn read_command_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameReadError> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    let mut read = 0usize;
    while read < LENGTH_PREFIX_BYTES {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(FrameReadError::Incomplete);
        }
        read += n;
    }

    let declared_bytes = u32::from_le_bytes(header) as usize;
    if declared_bytes > MAX_COMMAND_BYTES {
        return Err(FrameReadError::Oversized {
            declared_bytes,
            max_command_bytes: MAX_COMMAND_BYTES,
        });
    }

    let mut payload = vec![0u8; declared_bytes];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(FrameReadError::Incomplete),
        Err(err) => Err(FrameReadError::Io(err)),
    }
}

/// Accept loop for the controller channel. One command per connection;
/// malformed traffic is dropped and the loop keeps serving. Never terminates
/// the process on its own.
pub async fn run_control_server(
    listener: TcpListener,
    admission: Arc<AdmissionTable>,
    metrics: ProxyMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    let listen_addr = listener
        .local_addr()
        .context("failed to read control listen addr")?;
    println!("gk_proxy control channel listening on {listen_addr}");

    let mut gc_tick = tokio::time::interval(Duration::from_secs(60));
    gc_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = gc_tick.tick() => {
                while connections.try_join_next().is_some() {}
            }
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(_) => {
                        metrics.record_control_command("accept_error");
                        continue;
                    }
                };

                let admission = Arc::clone(&admission);
                let metrics = metrics.clone();
                connections.spawn(async move {
                    if let Err(err) = handle_connection(stream, &admission, &metrics).await {
                        eprintln!("gk_proxy control connection error: {err}");
                    }
                });
            }
        }
    }

    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    admission: &AdmissionTable,
    metrics: &ProxyMetrics,
) -> Result<(), FrameReadError> {
    let Some(payload) = read_command_frame(&mut stream).await? else {
        return Ok(());
    };

    match parse_command(&payload) {
        Some(command) => apply_command(admission, command, metrics),
        None => metrics.record_control_command("ignored"),
    }
    Ok(())
}

fn apply_command(admission: &AdmissionTable, command: ControlCommand, metrics: &ProxyMetrics) {
    match command {
        ControlCommand::Reset => {
            admission.reset();
            metrics.record_control_command("reset");
        }
        ControlCommand::Admit { player_id, address } => {
            admission.add(player_id, address);
            metrics.record_control_command("admit");
        }
        // The address travels with the revoke for wire compatibility only;
        // removal matches the player id.
        ControlCommand::Revoke { player_id, .. } => {
            admission.remove(player_id);
            metrics.record_control_command("revoke");
        }
    }
}

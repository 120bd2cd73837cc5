//! Bidirectional byte relay shared by proxy services and local forwarders.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes read per chunk in each direction.
pub const RELAY_BUFFER_BYTES: usize = 16 * 1024;

/// Bytes moved in each direction by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// From the first stream to the second.
    pub forward: u64,
    /// From the second stream to the first.
    pub backward: u64,
}

/// Copy bytes both ways between `a` and `b` until both directions reach
/// EOF. An EOF in one direction half-closes the opposite writer; an error in
/// either direction ends the relay.
///
/// # Errors
///
/// Returns the first I/O error from either direction.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (forward, backward) = tokio::try_join!(
        copy_half(&mut a_read, &mut b_write),
        copy_half(&mut b_read, &mut a_write),
    )?;
    Ok(RelayStats { forward, backward })
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0_u8; RELAY_BUFFER_BYTES];
    let mut total = 0_u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    // The peer may already be gone; the data has been delivered either way.
    let _ = writer.shutdown().await;
    Ok(total)
}

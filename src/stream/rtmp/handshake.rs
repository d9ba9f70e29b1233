//! RTMP simple handshake (C0/C1/C2 against S0/S1/S2)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, Result};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;

/// C1: 4 bytes time, 4 zero bytes, 1528 random bytes
fn client_c1(epoch_ms: u32) -> Vec<u8> {
    let mut c1 = Vec::with_capacity(HANDSHAKE_SIZE);
    c1.extend_from_slice(&epoch_ms.to_be_bytes());
    c1.extend_from_slice(&[0; 4]);
    c1.extend((8..HANDSHAKE_SIZE).map(|_| rand::random::<u8>()));
    c1
}

/// Run the client side of the handshake
pub async fn client_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let c1 = client_c1(0);
    let mut c0c1 = Vec::with_capacity(1 + HANDSHAKE_SIZE);
    c0c1.push(RTMP_VERSION);
    c0c1.extend_from_slice(&c1);
    stream.write_all(&c0c1).await?;
    stream.flush().await?;

    let s0 = stream.read_u8().await?;
    if s0 != RTMP_VERSION {
        return Err(AppError::Connection(format!(
            "server answered RTMP version {}",
            s0
        )));
    }

    let mut s1 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s1).await?;
    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut s2).await?;
    if s2[8..] != c1[8..] {
        tracing::debug!("S2 does not echo C1; continuing");
    }

    // C2 echoes S1
    stream.write_all(&s1).await?;
    stream.flush().await?;
    Ok(())
}

/// Server side, used by the in-process test server
#[cfg(test)]
pub async fn server_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let c0 = stream.read_u8().await?;
    if c0 != RTMP_VERSION {
        return Err(AppError::Connection(format!("client sent version {}", c0)));
    }
    let mut c1 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c1).await?;

    let s1 = client_c1(1);
    stream.write_u8(RTMP_VERSION).await?;
    stream.write_all(&s1).await?;
    stream.write_all(&c1).await?;
    stream.flush().await?;

    let mut c2 = vec![0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;
    if c2 != s1 {
        return Err(AppError::Connection("C2 does not echo S1".to_string()));
    }
    Ok(())
}

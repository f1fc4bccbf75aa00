// Copyright (c) 2016 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see write_queue.rs for the full text.

//! Length-prefixed message framing: a 4-byte little-endian length followed
//! by a `bincode`-encoded payload. A real Cap'n Proto message's wire form is
//! a segment count and sizes followed by the segments themselves; since
//! this workspace's messages are plain Rust values rather than zero-copy
//! segments, one opaque length prefix is all the framing needs to provide.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use vatkit::Error;

/// Writes `message` to `writer` as a length-prefixed `bincode` frame.
pub async fn write_message<W, M>(mut writer: W, message: &M) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    M: serde::Serialize,
{
    let bytes = bincode::serialize(message)
        .map_err(|e| Error::failed(format!("encode message: {e}")))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::failed("message too large to frame".into()))?;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::disconnected(format!("write frame length: {e}")))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::disconnected(format!("write frame body: {e}")))?;
    Ok(())
}

/// Reads one length-prefixed `bincode` frame from `reader`. Returns `Ok(None)`
/// on a clean EOF between frames (the peer closed the connection).
pub async fn read_message<R, M>(mut reader: R) -> Result<Option<M>, Error>
where
    R: AsyncRead + Unpin,
    M: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::disconnected(format!("read frame length: {e}"))),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::disconnected(format!("read frame body: {e}")))?;
    let message = bincode::deserialize(&body)
        .map_err(|e| Error::failed(format!("decode message: {e}")))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping(u32, String);

    #[tokio::test]
    async fn round_trips_a_message() {
        let (client, server) = tokio::io::duplex(256);
        let (mut read_half, mut write_half) = tokio::io::split(server);
        let _client = client;
        let sent = Ping(7, "hello".into());
        write_message(&mut write_half, &sent).await.unwrap();
        let received: Ping = read_message(&mut read_half).await.unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn returns_none_on_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let got: Option<Ping> = read_message(server).await.unwrap();
        assert!(got.is_none());
    }
}

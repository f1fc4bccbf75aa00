//! An in-process duplex byte stream, so `vatkit_rpc` connection tests don't
//! need real sockets. Each end implements `AsyncRead + AsyncWrite`, exactly
//! what `vatkit_rpc::twoparty::connect` expects.

use tokio::io::DuplexStream;

/// Returns a connected pair of in-memory byte streams, as if each were one
/// end of a socket. `capacity` bounds how much unread data either side may
/// buffer before a write blocks.
pub fn pipe(capacity: usize) -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn writes_on_one_end_are_readable_on_the_other() {
        let (mut a, mut b) = pipe(64);
        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}

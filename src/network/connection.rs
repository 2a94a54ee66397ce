use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::codec::{Codec, Message};
use crate::{AppError, AppResult};

/// Inbound half of one connection: the socket reader, the accumulation
/// buffer, and the codec decode loop.
///
/// The buffer is owned exclusively by the reader task; no other task ever
/// sees partially-assembled frames.
pub struct Connection {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    codec: Arc<dyn Codec>,
    framing_strikes: u32,
}

impl Connection {
    pub fn new(reader: OwnedReadHalf, codec: Arc<dyn Codec>, buffer_size: usize) -> Connection {
        Connection {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
            codec,
            framing_strikes: 0,
        }
    }

    /// Reads until the codec yields one complete message.
    ///
    /// Returns `None` when the peer closed the connection gracefully; a
    /// close in the middle of a frame surfaces as a connection reset. On a
    /// framing error the buffered bytes are discarded so the stream can
    /// resynchronize, and the strike counter lets the caller decide when
    /// to give up on the connection.
    pub async fn read_message(&mut self) -> AppResult<Option<Message>> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(message)) => {
                    self.framing_strikes = 0;
                    return Ok(Some(message));
                }
                Ok(None) => {}
                Err(err) if err.is_framing() => {
                    self.framing_strikes += 1;
                    self.buffer.clear();
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // peer closed the connection gracefully
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }

    /// Consecutive framing errors on this connection; any successful decode
    /// resets the count.
    pub fn framing_strikes(&self) -> u32 {
        self.framing_strikes
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::codec::LengthFieldCodec;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn codec() -> Arc<dyn Codec> {
        Arc::new(LengthFieldCodec::new("UTF-8", 64).unwrap())
    }

    #[tokio::test]
    async fn reassembles_a_frame_split_across_writes() {
        let (mut peer, local) = socket_pair().await;
        let (reader, _writer) = local.into_split();
        let mut connection = Connection::new(reader, codec(), 64);

        peer.write_all(&[0x00, 0x00, 0x00, 0x03, 0x61]).await.unwrap();
        peer.flush().await.unwrap();
        let read = tokio::spawn(async move { (connection.read_message().await, connection) });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        peer.write_all(&[0x62, 0x63]).await.unwrap();
        peer.flush().await.unwrap();

        let (result, _connection) = read.await.unwrap();
        assert_eq!(result.unwrap().unwrap().text().unwrap(), "abc");
    }

    #[tokio::test]
    async fn graceful_close_yields_none() {
        let (peer, local) = socket_pair().await;
        let (reader, _writer) = local.into_split();
        let mut connection = Connection::new(reader, codec(), 64);
        drop(peer);
        assert!(connection.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_mid_frame_is_a_reset() {
        let (mut peer, local) = socket_pair().await;
        let (reader, _writer) = local.into_split();
        let mut connection = Connection::new(reader, codec(), 64);

        peer.write_all(&[0x00, 0x00, 0x00, 0x09, 0x61]).await.unwrap();
        peer.flush().await.unwrap();
        drop(peer);

        assert!(matches!(
            connection.read_message().await,
            Err(AppError::IoError(_))
        ));
    }

    #[tokio::test]
    async fn framing_error_drops_buffer_and_counts_a_strike() {
        let (mut peer, local) = socket_pair().await;
        let (reader, _writer) = local.into_split();
        // frame limit of 64 bytes, the header below declares 4096
        let mut connection = Connection::new(reader, codec(), 64);

        peer.write_all(&[0x00, 0x00, 0x10, 0x00, 0xde, 0xad])
            .await
            .unwrap();
        peer.flush().await.unwrap();
        // let the whole corrupt segment land before reading
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(matches!(
            connection.read_message().await,
            Err(AppError::MalformedFrame(_))
        ));
        assert_eq!(connection.framing_strikes(), 1);

        // the stream resynchronizes on the next clean frame
        peer.write_all(&[0x00, 0x00, 0x00, 0x02, 0x68, 0x69])
            .await
            .unwrap();
        peer.flush().await.unwrap();
        let message = connection.read_message().await.unwrap().unwrap();
        assert_eq!(message.text().unwrap(), "hi");
        assert_eq!(connection.framing_strikes(), 0);
    }
}

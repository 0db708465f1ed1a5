//! Mutually authenticated channels between the nodes of a pool.
//!
//! Peers frame messages with a length-delimited codec over TCP
//! and encrypt every frame with a Noise session. Authentication
//! is the pool shared secret, mixed in as a pre-shared key:
//! a peer without the secret cannot complete the handshake.

use anyhow::{Context, anyhow};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s";

/// Noise messages cap at 64KiB. Logical payloads are split into
/// segments below the cap and reassembled on the receiving side.
const MAX_SEGMENT: usize = 60 * 1024;

const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

/// Derives the 32 byte Noise PSK from the pool shared secret.
fn psk(pool_secret: &str) -> [u8; 32] {
  let mut hasher = Sha256::new();
  hasher.update(b"armada-pool-psk");
  hasher.update(pool_secret.as_bytes());
  hasher.finalize().into()
}

pub struct SecureChannel {
  framed: Framed<TcpStream, LengthDelimitedCodec>,
  noise: snow::TransportState,
}

impl SecureChannel {
  /// Dial a peer and run the initiator side of the handshake.
  pub async fn connect(
    addr: &str,
    pool_secret: &str,
  ) -> anyhow::Result<SecureChannel> {
    let stream = TcpStream::connect(addr)
      .await
      .with_context(|| format!("failed to connect to {addr}"))?;
    let mut framed =
      Framed::new(stream, LengthDelimitedCodec::new());

    let mut handshake = snow::Builder::new(
      NOISE_PATTERN.parse().context("invalid noise pattern")?,
    )
    .psk(0, &psk(pool_secret))
    .context("failed to set channel psk")?
    .build_initiator()
    .context("failed to build noise initiator")?;

    let mut buf = vec![0u8; 1024];
    // -> psk, e
    let len = handshake
      .write_message(&[], &mut buf)
      .context("handshake write failed")?;
    framed.send(Bytes::copy_from_slice(&buf[..len])).await?;
    // <- e, ee
    let frame = framed
      .next()
      .await
      .context("peer closed during handshake")?
      .context("handshake read failed")?;
    handshake
      .read_message(&frame, &mut buf)
      .context("handshake verification failed")?;

    Ok(SecureChannel {
      framed,
      noise: handshake
        .into_transport_mode()
        .context("failed to enter transport mode")?,
    })
  }

  /// Run the responder side of the handshake over an accepted
  /// connection.
  pub async fn accept(
    stream: TcpStream,
    pool_secret: &str,
  ) -> anyhow::Result<SecureChannel> {
    let mut framed =
      Framed::new(stream, LengthDelimitedCodec::new());

    let mut handshake = snow::Builder::new(
      NOISE_PATTERN.parse().context("invalid noise pattern")?,
    )
    .psk(0, &psk(pool_secret))
    .context("failed to set channel psk")?
    .build_responder()
    .context("failed to build noise responder")?;

    let mut buf = vec![0u8; 1024];
    // -> psk, e
    let frame = framed
      .next()
      .await
      .context("peer closed during handshake")?
      .context("handshake read failed")?;
    handshake
      .read_message(&frame, &mut buf)
      .context("handshake verification failed")?;
    // <- e, ee
    let len = handshake
      .write_message(&[], &mut buf)
      .context("handshake write failed")?;
    framed.send(Bytes::copy_from_slice(&buf[..len])).await?;

    Ok(SecureChannel {
      framed,
      noise: handshake
        .into_transport_mode()
        .context("failed to enter transport mode")?,
    })
  }

  /// Encrypt and send one logical payload of arbitrary size.
  pub async fn send_payload(
    &mut self,
    payload: &[u8],
  ) -> anyhow::Result<()> {
    let mut chunks = payload.chunks(MAX_SEGMENT).peekable();
    // Always at least one segment, even for an empty payload.
    if chunks.peek().is_none() {
      return self.send_segment(FLAG_FINAL, &[]).await;
    }
    while let Some(chunk) = chunks.next() {
      let flag = if chunks.peek().is_some() {
        FLAG_MORE
      } else {
        FLAG_FINAL
      };
      self.send_segment(flag, chunk).await?;
    }
    Ok(())
  }

  async fn send_segment(
    &mut self,
    flag: u8,
    chunk: &[u8],
  ) -> anyhow::Result<()> {
    let mut plain = Vec::with_capacity(chunk.len() + 1);
    plain.push(flag);
    plain.extend_from_slice(chunk);
    let mut cipher = vec![0u8; plain.len() + 16];
    let len = self
      .noise
      .write_message(&plain, &mut cipher)
      .map_err(|e| anyhow!("encryption failed: {e}"))?;
    self
      .framed
      .send(Bytes::copy_from_slice(&cipher[..len]))
      .await
      .context("failed to send frame")?;
    Ok(())
  }

  /// Receive one logical payload. Returns None on clean close
  /// at a payload boundary.
  pub async fn recv_payload(
    &mut self,
  ) -> anyhow::Result<Option<Vec<u8>>> {
    let mut payload = Vec::new();
    let mut started = false;
    loop {
      let Some(frame) = self.framed.next().await else {
        if started {
          return Err(anyhow!("peer closed mid payload"));
        }
        return Ok(None);
      };
      let frame = frame.context("failed to read frame")?;
      let mut plain = vec![0u8; frame.len()];
      let len = self
        .noise
        .read_message(&frame, &mut plain)
        .map_err(|e| anyhow!("decryption failed: {e}"))?;
      if len == 0 {
        return Err(anyhow!("empty segment"));
      }
      started = true;
      payload.extend_from_slice(&plain[1..len]);
      if plain[0] == FLAG_FINAL {
        return Ok(Some(payload));
      }
    }
  }

  pub async fn send<T: Serialize>(
    &mut self,
    message: &T,
  ) -> anyhow::Result<()> {
    let json = serde_json::to_vec(message)
      .context("failed to serialize message")?;
    self.send_payload(&json).await
  }

  pub async fn recv<T: DeserializeOwned>(
    &mut self,
  ) -> anyhow::Result<Option<T>> {
    let Some(payload) = self.recv_payload().await? else {
      return Ok(None);
    };
    serde_json::from_slice(&payload)
      .context("failed to deserialize message")
      .map(Some)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use tokio::net::TcpListener;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Ping {
    seq: u64,
  }

  #[tokio::test]
  async fn round_trip_with_shared_secret() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut channel =
        SecureChannel::accept(stream, "s3cret").await.unwrap();
      let ping: Ping = channel.recv().await.unwrap().unwrap();
      channel.send(&Ping { seq: ping.seq + 1 }).await.unwrap();
      // Large payload crossing the segment boundary.
      let blob = channel.recv_payload().await.unwrap().unwrap();
      channel.send_payload(&blob).await.unwrap();
    });

    let mut channel =
      SecureChannel::connect(&addr, "s3cret").await.unwrap();
    channel.send(&Ping { seq: 1 }).await.unwrap();
    let pong: Ping = channel.recv().await.unwrap().unwrap();
    assert_eq!(pong, Ping { seq: 2 });

    let blob = vec![7u8; 200 * 1024];
    channel.send_payload(&blob).await.unwrap();
    let echoed = channel.recv_payload().await.unwrap().unwrap();
    assert_eq!(echoed, blob);

    server.await.unwrap();
  }

  #[tokio::test]
  async fn wrong_secret_fails_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let _ = SecureChannel::accept(stream, "right").await;
    });

    let result = SecureChannel::connect(&addr, "wrong").await;
    assert!(result.is_err());
    let _ = server.await;
  }
}

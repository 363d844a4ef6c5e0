//! The transport layer: connections, factories, and the registry exported
//! to hosts.
//!
//! A host embeds this core through three types: [`ClientFactory`] parses
//! bridge arguments and wraps outgoing streams, [`ServerFactory`] owns a
//! bridge's long-term material and wraps accepted streams, and
//! [`Obfs4Stream`] is the resulting byte pipe. The [`Registry`] maps
//! transport names to constructors for hosts that multiplex several
//! transports.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

pub mod client;
pub mod connection;
pub mod server;
pub mod statefile;

pub use client::{ClientArgs, ClientFactory};
pub use connection::{Obfs4Stream, CLIENT_HANDSHAKE_TIMEOUT, SERVER_HANDSHAKE_TIMEOUT};
pub use server::ServerFactory;
pub use statefile::{ServerState, BRIDGE_LINE_FILE, STATE_FILE};

/// The transport's registered name.
pub const TRANSPORT_NAME: &str = "obfs4";

/// Transport arguments, as parsed out-of-band by the host (e.g. from a
/// bridge line or SOCKS auth fields).
pub type Args = HashMap<String, String>;

/// Compile-time switch for inter-arrival-time obfuscation.
///
/// The hook sleeps a sampled delay between written segments. It carries a
/// measurable throughput cost and stays off unless a deployment opts in by
/// flipping this.
pub(crate) const IAT_OBFUSCATION: bool = false;

/// Maximum IAT delay in 100 microsecond increments.
pub(crate) const MAX_IAT_DELAY: usize = 100;

/// Handle for one registered transport protocol.
pub struct Transport;

impl Transport {
    /// The transport's name.
    pub fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    /// Construct the client side factory.
    pub fn client_factory(&self, _state_dir: &Path) -> Result<ClientFactory> {
        Ok(ClientFactory::new())
    }

    /// Construct the server side factory.
    pub fn server_factory(&self, state_dir: &Path, args: &Args) -> Result<ServerFactory> {
        ServerFactory::new(state_dir, args)
    }
}

/// Named lookup table of the transports this crate exports.
pub struct Registry {
    transports: HashMap<&'static str, Transport>,
}

impl Registry {
    /// Create a registry holding every supported transport.
    pub fn new() -> Self {
        let mut transports = HashMap::new();
        transports.insert(TRANSPORT_NAME, Transport);
        Self { transports }
    }

    /// Look a transport up by name.
    pub fn get(&self, name: &str) -> Option<&Transport> {
        self.transports.get(name)
    }

    /// The names of all registered transports.
    pub fn names(&self) -> Vec<&'static str> {
        self.transports.keys().copied().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::{Buf, BytesMut};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::{Duration, Instant};

    use crate::crypto::ntor::{self, Keypair, NodeID, PublicKey};
    use crate::error::Error;
    use crate::framing::{Decoder, Encoder, KEY_MATERIAL_LENGTH, TAG_LENGTH};
    use crate::handshake::{ClientHandshake, Parse, MAX_HANDSHAKE_LENGTH};
    use crate::packet::{make_packet, PacketType};
    use crate::probdist::WeightedDist;

    fn fixtures() -> (Arc<ServerFactory>, ClientFactory, Args) {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ServerFactory::new(dir.path(), &Args::new()).unwrap());
        let bridge_args = server.client_args();
        (server, ClientFactory::new(), bridge_args)
    }

    async fn established_pair(
        server: Arc<ServerFactory>,
        client: &ClientFactory,
        bridge_args: &Args,
    ) -> (Obfs4Stream<DuplexStream>, Obfs4Stream<DuplexStream>) {
        let (client_end, server_end) = duplex(256 * 1024);

        let server_task =
            tokio::spawn(async move { server.wrap(server_end).await });

        let args = client.parse_args(bridge_args).unwrap();
        let client_conn = client.wrap(client_end, args).await.unwrap();
        let server_conn = server_task.await.unwrap().unwrap();

        (client_conn, server_conn)
    }

    /// Drive the client handshake by hand over a raw stream, returning the
    /// established link crypto and any leftover buffered bytes.
    async fn manual_client_handshake(
        stream: &mut DuplexStream,
        node_id: NodeID,
        server_pk: PublicKey,
    ) -> (Encoder, Decoder, BytesMut) {
        let mut hs = ClientHandshake::new(node_id, server_pk, Keypair::generate(true));
        let blob = hs.generate_handshake();
        stream.write_all(&blob).await.unwrap();

        let mut buf = BytesMut::new();
        loop {
            buf.reserve(MAX_HANDSHAKE_LENGTH);
            let n = stream.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed during handshake");

            match hs.parse_server_handshake(&buf).unwrap() {
                Parse::NeedMore => continue,
                Parse::Complete(done) => {
                    buf.advance(done.consumed);
                    let okm = ntor::kdf(&done.key_seed, KEY_MATERIAL_LENGTH * 2);
                    return (
                        Encoder::new(&okm[..KEY_MATERIAL_LENGTH]),
                        Decoder::new(&okm[KEY_MATERIAL_LENGTH..]),
                        buf,
                    );
                }
            }
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::new();

        assert!(registry.get("obfs4").is_some());
        assert!(registry.get("meek-lite").is_none());
        assert_eq!(registry.names(), vec!["obfs4"]);
        assert_eq!(registry.get("obfs4").unwrap().name(), "obfs4");
    }

    #[tokio::test]
    async fn test_end_to_end_transfer() {
        let (server, client, bridge_args) = fixtures();
        let (mut client_conn, mut server_conn) =
            established_pair(server, &client, &bridge_args).await;

        // Client to server.
        client_conn.write(b"hello bridge").await.unwrap();
        let mut buf = [0u8; 64];
        let n = server_conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello bridge");

        // Server to client.
        server_conn.write(b"hello client").await.unwrap();
        let n = client_conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello client");
    }

    #[tokio::test]
    async fn test_large_transfer_spans_many_packets() {
        let (server, client, bridge_args) = fixtures();
        let (mut client_conn, mut server_conn) =
            established_pair(server, &client, &bridge_args).await;

        let mut payload = vec![0u8; 100_000];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            client_conn.write(&payload).await.unwrap();
            client_conn
        });

        let mut received = Vec::with_capacity(sent.len());
        let mut buf = [0u8; 4096];
        while received.len() < sent.len() {
            let n = server_conn.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }

        assert_eq!(received, sent);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_prng_seed_reseeds_client_distribution() {
        let (server, client, bridge_args) = fixtures();
        let server_dist =
            WeightedDist::new(server.len_seed(), 0, crate::framing::MAX_SEGMENT_LENGTH);

        let (mut client_conn, mut server_conn) =
            established_pair(server, &client, &bridge_args).await;

        // Before consuming the seed packet the client is on its own
        // throwaway distribution.
        assert!(client_conn.len_dist() != &server_dist);

        // The seed packet is buffered ahead of the first payload, so one
        // read suffices to adopt the bridge's distribution.
        server_conn.write(b"x").await.unwrap();
        let mut buf = [0u8; 16];
        client_conn.read(&mut buf).await.unwrap();

        assert!(client_conn.len_dist() == &server_dist);
    }

    #[tokio::test]
    async fn test_close_semantics() {
        let (server, client, bridge_args) = fixtures();
        let (mut client_conn, _server_conn) =
            established_pair(server, &client, &bridge_args).await;

        assert!(client_conn.close().await.is_ok());
        assert!(matches!(client_conn.close().await, Err(Error::InvalidState)));

        let mut buf = [0u8; 16];
        assert!(matches!(
            client_conn.read(&mut buf).await,
            Err(Error::InvalidState)
        ));
        assert!(matches!(
            client_conn.write(b"late").await,
            Err(Error::InvalidState)
        ));
        assert!(client_conn.peer_addr().is_none());
        assert!(client_conn.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_deadlines() {
        let (server, client, bridge_args) = fixtures();
        let (mut client_conn, _server_conn) =
            established_pair(server, &client, &bridge_args).await;

        assert!(matches!(
            client_conn.set_deadline(Some(Instant::now())),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            client_conn.set_write_deadline(Some(Instant::now())),
            Err(Error::NotSupported)
        ));
        assert!(client_conn.set_read_deadline(None).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_expires_without_breaking() {
        let (server, client, bridge_args) = fixtures();
        let (mut client_conn, mut server_conn) =
            established_pair(server, &client, &bridge_args).await;

        client_conn
            .set_read_deadline(Some(Instant::now() + Duration::from_secs(1)))
            .unwrap();

        let mut buf = [0u8; 16];
        match client_conn.read(&mut buf).await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }

        // The connection survives the timeout.
        client_conn.set_read_deadline(None).unwrap();
        server_conn.write(b"still alive").await.unwrap();
        let n = client_conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still alive");
    }

    #[tokio::test]
    async fn test_tampered_frame_breaks_connection() {
        let (server, _client, bridge_args) = fixtures();
        let node_id = NodeID::from_base64(bridge_args.get("node-id").unwrap()).unwrap();
        let server_pk = PublicKey::from_base64(bridge_args.get("public-key").unwrap()).unwrap();

        let (mut client_end, server_end) = duplex(256 * 1024);
        let server_task = tokio::spawn(async move { server.wrap(server_end).await });

        let (mut encoder, _decoder, _leftover) =
            manual_client_handshake(&mut client_end, node_id, server_pk).await;
        let mut server_conn = server_task.await.unwrap().unwrap();

        // Flip one bit of the second ciphertext byte of the first payload
        // frame.
        let pkt = make_packet(PacketType::Payload, b"tampered payload", 0);
        let mut frame = encoder.encode(&pkt).unwrap();
        frame[2 + TAG_LENGTH + 1] ^= 0x01;
        client_end.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(
            server_conn.read(&mut buf).await,
            Err(Error::TagMismatch)
        ));

        // No further frames are accepted.
        assert!(matches!(
            server_conn.read(&mut buf).await,
            Err(Error::InvalidState)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_handshake_rejected_end_to_end() {
        let (server, _client, bridge_args) = fixtures();
        let node_id = NodeID::from_base64(bridge_args.get("node-id").unwrap()).unwrap();
        let server_pk = PublicKey::from_base64(bridge_args.get("public-key").unwrap()).unwrap();

        // A legitimate client handshake, with the wire bytes captured.
        let mut hs = ClientHandshake::new(node_id, server_pk, Keypair::generate(true));
        let blob = hs.generate_handshake();

        let (mut client_end, server_end) = duplex(256 * 1024);
        let first_server = Arc::clone(&server);
        let server_task = tokio::spawn(async move { first_server.wrap(server_end).await });
        client_end.write_all(&blob).await.unwrap();

        // Drain the server's response so the first connection completes.
        let mut buf = BytesMut::new();
        loop {
            buf.reserve(MAX_HANDSHAKE_LENGTH);
            let n = client_end.read_buf(&mut buf).await.unwrap();
            assert!(n > 0);
            match hs.parse_server_handshake(&buf).unwrap() {
                Parse::NeedMore => continue,
                Parse::Complete(_) => break,
            }
        }
        server_task.await.unwrap().unwrap();

        // Replaying the identical bytes fails; the socket closing promptly
        // (rather than after the delay budgets) is because this peer hangs
        // up right after writing.
        let (mut replay_end, server_end) = duplex(256 * 1024);
        let server_task = tokio::spawn(async move { server.wrap(server_end).await });
        replay_end.write_all(&blob).await.unwrap();
        drop(replay_end);

        assert!(matches!(
            server_task.await.unwrap(),
            Err(Error::Replayed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_resistance_delayed_close() {
        let (server, _client, _bridge_args) = fixtures();

        let (mut probe_end, server_end) = duplex(256 * 1024);
        let started = Instant::now();
        let server_task = tokio::spawn(async move { server.wrap(server_end).await });

        // 4096 random bytes cannot contain the mark, so once the maximum
        // handshake length is exceeded the parse is fatal and the server
        // lingers, draining, within its delay budgets.
        let mut garbage = vec![0u8; 4096];
        crate::crypto::SecureRandom::fill(&mut garbage);
        probe_end.write_all(&garbage).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(Error::InvalidHandshake)));

        // The probe never observes a close later than the handshake timeout
        // plus the maximum close delay.
        let elapsed = started.elapsed();
        assert!(elapsed <= Duration::from_secs(30 + 60));

        // The server end is closed; the probe's next read reports EOF.
        let mut buf = [0u8; 16];
        let n = probe_end.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}

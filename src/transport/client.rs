//! Client-side connection factory.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::crypto::drbg::Seed;
use crate::crypto::ntor::{Keypair, NodeID, PublicKey};
use crate::error::{Error, Result};
use crate::framing;
use crate::handshake::ClientHandshake;
use crate::probdist::WeightedDist;
use crate::transport::connection::Obfs4Stream;
use crate::transport::statefile::{NODE_ID_ARG, PUBLIC_KEY_ARG};
use crate::transport::{Args, IAT_OBFUSCATION};

/// Parsed and validated client arguments for a single connection attempt.
pub struct ClientArgs {
    node_id: NodeID,
    public_key: PublicKey,
    session_key: Keypair,
}

/// Factory for outgoing obfs4 connections.
#[derive(Default)]
pub struct ClientFactory;

impl ClientFactory {
    /// Create a new client factory.
    pub fn new() -> Self {
        Self
    }

    /// Parse the bridge arguments.
    ///
    /// Requires `node-id` (base64, 20 bytes) and `public-key` (base64, 32
    /// bytes). The session keypair is generated here, before connecting, to
    /// keep the Elligator2 rejection sampling cost away from anything a
    /// network observer can time.
    pub fn parse_args(&self, args: &Args) -> Result<ClientArgs> {
        let node_id_str = args
            .get(NODE_ID_ARG)
            .ok_or_else(|| Error::arg(format!("missing argument '{}'", NODE_ID_ARG)))?;
        let node_id = NodeID::from_base64(node_id_str)?;

        let public_key_str = args
            .get(PUBLIC_KEY_ARG)
            .ok_or_else(|| Error::arg(format!("missing argument '{}'", PUBLIC_KEY_ARG)))?;
        let public_key = PublicKey::from_base64(public_key_str)?;

        let session_key = Keypair::generate(true);

        Ok(ClientArgs {
            node_id,
            public_key,
            session_key,
        })
    }

    /// Wrap a raw stream, driving the client handshake to completion.
    ///
    /// The arguments are consumed: the session keypair they carry is
    /// single-use.
    pub async fn wrap<S>(&self, stream: S, args: ClientArgs) -> Result<Obfs4Stream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // The initial length distribution comes from throwaway local
        // randomness; the server's PRNG seed packet replaces it right after
        // the handshake.
        let seed = Seed::generate();
        let len_dist = WeightedDist::new(&seed, 0, framing::MAX_SEGMENT_LENGTH);
        let iat_dist = if IAT_OBFUSCATION {
            let iat_seed = Seed::from_bytes(&sha256(seed.as_bytes()))
                .expect("digest has seed length");
            Some(WeightedDist::new(
                &iat_seed,
                0,
                crate::transport::MAX_IAT_DELAY,
            ))
        } else {
            None
        };

        let mut conn = Obfs4Stream::new(stream, false, len_dist, iat_dist);
        let hs = ClientHandshake::new(args.node_id, args.public_key, args.session_key);
        conn.client_handshake(hs).await?;
        Ok(conn)
    }

    /// Connect to `addr` over TCP and wrap the resulting stream.
    pub async fn dial(&self, addr: &str, args: ClientArgs) -> Result<Obfs4Stream<TcpStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();

        let mut conn = self.wrap(stream, args).await?;
        conn.set_addrs(local, peer);
        Ok(conn)
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_args() -> Args {
        let identity = Keypair::generate(false);
        let node_id = NodeID::new(&[0x13u8; 20]).unwrap();

        let mut args = HashMap::new();
        args.insert(NODE_ID_ARG.to_string(), node_id.to_base64());
        args.insert(PUBLIC_KEY_ARG.to_string(), identity.public().to_base64());
        args
    }

    #[test]
    fn test_parse_args() {
        let factory = ClientFactory::new();
        let parsed = factory.parse_args(&valid_args()).unwrap();

        // The session keypair is pre-generated and representable.
        assert!(parsed.session_key.representative().is_some());
    }

    #[test]
    fn test_missing_args_rejected() {
        let factory = ClientFactory::new();

        let mut args = valid_args();
        args.remove(NODE_ID_ARG);
        assert!(matches!(factory.parse_args(&args), Err(Error::Arg(_))));

        let mut args = valid_args();
        args.remove(PUBLIC_KEY_ARG);
        assert!(matches!(factory.parse_args(&args), Err(Error::Arg(_))));
    }

    #[test]
    fn test_malformed_args_rejected() {
        let factory = ClientFactory::new();

        let mut args = valid_args();
        args.insert(NODE_ID_ARG.to_string(), "AAAA".to_string());
        assert!(factory.parse_args(&args).is_err());

        let mut args = valid_args();
        args.insert(PUBLIC_KEY_ARG.to_string(), "!!!not-base64".to_string());
        assert!(factory.parse_args(&args).is_err());
    }
}

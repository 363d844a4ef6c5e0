//! Server-side connection factory.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::crypto::drbg::{HashDrbg, Seed};
use crate::crypto::ntor::{Keypair, NodeID};
use crate::error::Result;
use crate::framing;
use crate::handshake::ServerHandshake;
use crate::probdist::WeightedDist;
use crate::replay::ReplayFilter;
use crate::transport::connection::{
    Obfs4Stream, MAX_CLOSE_DELAY_BYTES, MAX_CLOSE_DELAY_SECS,
};
use crate::transport::statefile::{ServerState, NODE_ID_ARG, PUBLIC_KEY_ARG};
use crate::transport::{Args, IAT_OBFUSCATION};

/// Factory for accepting obfs4 connections on a bridge.
///
/// Owns the long-term identity, the per-bridge length seed, the replay
/// filter shared by every connection, and the randomized close-delay
/// budgets.
pub struct ServerFactory {
    node_id: NodeID,
    identity: Arc<Keypair>,
    len_seed: Seed,
    iat_seed: Option<Seed>,
    filter: Arc<ReplayFilter>,

    close_delay_bytes: usize,
    close_delay_secs: u64,
}

impl ServerFactory {
    /// Create a factory from the state directory and transport arguments.
    ///
    /// See [`ServerState::from_args`] for how the identity is resolved.
    pub fn new(state_dir: &Path, args: &Args) -> Result<Self> {
        let state = ServerState::from_args(state_dir, args)?;

        let iat_seed = if IAT_OBFUSCATION {
            Some(
                Seed::from_bytes(&sha256(state.drbg_seed.as_bytes()))
                    .expect("digest has seed length"),
            )
        } else {
            None
        };

        // Drawn from the bridge seed, so the budgets are stable across
        // restarts.
        let mut rng = HashDrbg::new(&state.drbg_seed);
        let close_delay_bytes = rng.int_n(MAX_CLOSE_DELAY_BYTES);
        let close_delay_secs = rng.int_n(MAX_CLOSE_DELAY_SECS as usize) as u64;

        Ok(Self {
            node_id: state.node_id,
            identity: Arc::new(state.identity),
            len_seed: state.drbg_seed,
            iat_seed,
            filter: Arc::new(ReplayFilter::new()),
            close_delay_bytes,
            close_delay_secs,
        })
    }

    /// The arguments clients need to reach this bridge, for out-of-band
    /// publication.
    pub fn client_args(&self) -> Args {
        let mut args = Args::new();
        args.insert(NODE_ID_ARG.to_string(), self.node_id.to_base64());
        args.insert(
            PUBLIC_KEY_ARG.to_string(),
            self.identity.public().to_base64(),
        );
        args
    }

    /// Wrap an accepted raw stream, driving the server handshake.
    ///
    /// On handshake failure the connection enters the deliberate-delay
    /// close, draining and discarding peer bytes within the factory's
    /// budgets before closing, so active probes observe nothing but a quiet
    /// long-lived flow.
    pub async fn wrap<S>(&self, stream: S) -> Result<Obfs4Stream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Generate the session keypair before consuming data from the peer
        // to mask the Elligator2 rejection sampling.
        let session_key = Keypair::generate(true);

        let len_dist = WeightedDist::new(&self.len_seed, 0, framing::MAX_SEGMENT_LENGTH);
        let iat_dist = self
            .iat_seed
            .as_ref()
            .map(|seed| WeightedDist::new(seed, 0, crate::transport::MAX_IAT_DELAY));

        let mut conn = Obfs4Stream::new(stream, true, len_dist, iat_dist);
        let start = Instant::now();

        let hs = ServerHandshake::new(
            self.node_id,
            Arc::clone(&self.identity),
            Arc::clone(&self.filter),
            session_key,
        );
        match conn.server_handshake(hs, &self.len_seed).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                tracing::debug!("server handshake failed, entering delayed close");
                conn.close_after_delay(self.close_delay_bytes, self.close_delay_secs, start)
                    .await;
                Err(e)
            }
        }
    }

    /// Wrap an accepted TCP stream, capturing its addresses.
    pub async fn wrap_tcp(&self, stream: TcpStream) -> Result<Obfs4Stream<TcpStream>> {
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();

        let mut conn = self.wrap(stream).await?;
        conn.set_addrs(local, peer);
        Ok(conn)
    }

    #[cfg(test)]
    pub(crate) fn close_delay_budgets(&self) -> (usize, u64) {
        (self.close_delay_bytes, self.close_delay_secs)
    }

    #[cfg(test)]
    pub(crate) fn len_seed(&self) -> &Seed {
        &self.len_seed
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

    #[test]
    fn test_factory_from_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ServerFactory::new(dir.path(), &Args::new()).unwrap();

        let args = factory.client_args();
        assert!(args.contains_key(NODE_ID_ARG));
        assert!(args.contains_key(PUBLIC_KEY_ARG));
    }

    #[test]
    fn test_close_delay_budgets_in_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ServerFactory::new(dir.path(), &Args::new()).unwrap();

        let (bytes, secs) = factory.close_delay_budgets();
        assert!(bytes < MAX_CLOSE_DELAY_BYTES);
        assert!(secs < MAX_CLOSE_DELAY_SECS);
    }

    #[test]
    fn test_close_delay_budgets_deterministic() {
        // The budgets derive from the bridge seed, so two factories over
        // the same state agree.
        let dir = tempfile::tempdir().unwrap();
        let a = ServerFactory::new(dir.path(), &Args::new()).unwrap();
        let b = ServerFactory::new(dir.path(), &Args::new()).unwrap();

        assert_eq!(a.close_delay_budgets(), b.close_delay_budgets());
    }
}

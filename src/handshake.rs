//! The obfs4 handshake.
//!
//! One message in each direction, sent before any link keys exist, so the
//! framing layer cannot delimit them. Instead each message is random padding
//! bracketed by a detection mark and a MAC:
//!
//! ```text
//! client: X | P_C | M_C | MAC(X | P_C | M_C | E)
//! server: Y | AUTH | P_S | M_S | MAC(Y | AUTH | P_S | M_S | E)
//! ```
//!
//! where X and Y are Elligator2 representatives of the ephemeral session
//! keys, P is random padding, M is HMAC-SHA256(identity public key, X or Y),
//! the MAC is keyed the same way, and E is the number of hours since the
//! UNIX epoch as a decimal ASCII string. E never appears on the wire; the
//! hour binding frustrates replays across hours without requiring clock
//! sync, and the replay filter handles the intra-hour window.
//!
//! A parser accumulates bytes, locates the mark after the variable padding,
//! and only then checks the MAC. The server tolerates E being off by one
//! hour in either direction; the client, authoritative over its own clock,
//! accepts only the hour it used.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::crypto::ntor::{
    self, Auth, Keypair, KeySeed, NodeID, PublicKey, Representative, AUTH_LENGTH,
    REPRESENTATIVE_LENGTH,
};
use crate::crypto::random::SecureRandom;
use crate::error::{Error, Result};
use crate::framing;
use crate::replay::ReplayFilter;

type HmacSha256 = Hmac<Sha256>;

const MARK_LENGTH: usize = 32;
const MAC_LENGTH: usize = 32;

/// Minimum byte count of a client handshake message.
pub const CLIENT_MIN_HANDSHAKE_LENGTH: usize =
    REPRESENTATIVE_LENGTH + MARK_LENGTH + MAC_LENGTH;

/// Minimum byte count of a server handshake message.
pub const SERVER_MIN_HANDSHAKE_LENGTH: usize =
    REPRESENTATIVE_LENGTH + AUTH_LENGTH + MARK_LENGTH + MAC_LENGTH;

/// Maximum byte count of a handshake message in either direction.
pub const MAX_HANDSHAKE_LENGTH: usize = framing::MAX_SEGMENT_LENGTH;

const CLIENT_MIN_PAD_LENGTH: usize = SERVER_MIN_HANDSHAKE_LENGTH - CLIENT_MIN_HANDSHAKE_LENGTH;
const CLIENT_MAX_PAD_LENGTH: usize = MAX_HANDSHAKE_LENGTH - CLIENT_MIN_HANDSHAKE_LENGTH;
const SERVER_MIN_PAD_LENGTH: usize = 0;
const SERVER_MAX_PAD_LENGTH: usize = MAX_HANDSHAKE_LENGTH - SERVER_MIN_HANDSHAKE_LENGTH;

/// Outcome of feeding accumulated bytes to a handshake parser.
pub enum Parse<T> {
    /// The message was fully parsed and validated.
    Complete(T),
    /// Not enough bytes yet; accumulate more and call again.
    NeedMore,
}

/// Client-side result: bytes consumed from the buffer plus the derived seed.
pub struct ClientDone {
    /// Bytes of the buffer belonging to the server handshake message.
    pub consumed: usize,
    /// The shared ntor KEY_SEED.
    pub key_seed: KeySeed,
}

/// Server-side result.
pub struct ServerDone {
    /// The shared ntor KEY_SEED.
    pub key_seed: KeySeed,
}

/// Client handshake state.
pub struct ClientHandshake {
    keypair: Keypair,
    node_id: NodeID,
    server_identity: PublicKey,
    epoch_hour: String,

    server_representative: Option<Representative>,
    server_auth: Option<[u8; AUTH_LENGTH]>,
    server_mark: Option<[u8; MARK_LENGTH]>,
}

impl ClientHandshake {
    /// Create the client state around a pre-generated session keypair.
    ///
    /// # Panics
    ///
    /// Panics if the session keypair carries no Elligator2 representative.
    pub fn new(node_id: NodeID, server_identity: PublicKey, session_key: Keypair) -> Self {
        assert!(
            session_key.representative().is_some(),
            "client session keypair must be representable"
        );
        Self {
            keypair: session_key,
            node_id,
            server_identity,
            epoch_hour: String::new(),
            server_representative: None,
            server_auth: None,
            server_mark: None,
        }
    }

    /// Generate the handshake message to send.
    pub fn generate_handshake(&mut self) -> Vec<u8> {
        self.generate_handshake_at(unix_seconds())
    }

    fn generate_handshake_at(&mut self, now: i64) -> Vec<u8> {
        let repr = self
            .keypair
            .representative()
            .expect("checked at construction");
        let mark = hmac256(self.server_identity.as_bytes(), &[repr.as_bytes()]);

        let pad_len = SecureRandom::int_in_range(CLIENT_MIN_PAD_LENGTH, CLIENT_MAX_PAD_LENGTH);
        let mut buf = Vec::with_capacity(CLIENT_MIN_HANDSHAKE_LENGTH + pad_len);
        buf.extend_from_slice(repr.as_bytes());
        buf.resize(buf.len() + pad_len, 0);
        SecureRandom::fill(&mut buf[REPRESENTATIVE_LENGTH..]);
        buf.extend_from_slice(&mark);

        self.epoch_hour = (now / 3600).to_string();
        let mac = hmac256(
            self.server_identity.as_bytes(),
            &[&buf, self.epoch_hour.as_bytes()],
        );
        buf.extend_from_slice(&mac);

        buf
    }

    /// Attempt to parse the server's handshake message from the accumulated
    /// bytes.
    ///
    /// On success the caller must discard exactly `consumed` bytes; anything
    /// after them belongs to the frame stream.
    pub fn parse_server_handshake(&mut self, resp: &[u8]) -> Result<Parse<ClientDone>> {
        // No point examining the data until the minimum plausible response
        // has arrived.
        if resp.len() < SERVER_MIN_HANDSHAKE_LENGTH {
            return Ok(Parse::NeedMore);
        }

        if self.server_representative.is_none() {
            let repr = Representative::from_bytes(&resp[0..REPRESENTATIVE_LENGTH])?;
            let auth: [u8; AUTH_LENGTH] = resp
                [REPRESENTATIVE_LENGTH..REPRESENTATIVE_LENGTH + AUTH_LENGTH]
                .try_into()
                .expect("length checked above");
            self.server_mark = Some(hmac256(
                self.server_identity.as_bytes(),
                &[repr.as_bytes()],
            ));
            self.server_representative = Some(repr);
            self.server_auth = Some(auth);
        }

        let mark = self.server_mark.as_ref().expect("mark derived above");
        let pos = match find_mark(
            mark,
            resp,
            REPRESENTATIVE_LENGTH + AUTH_LENGTH,
            MAX_HANDSHAKE_LENGTH,
        ) {
            Some(pos) => pos,
            None => {
                if resp.len() >= MAX_HANDSHAKE_LENGTH {
                    return Err(Error::InvalidHandshake);
                }
                return Ok(Parse::NeedMore);
            }
        };
        if resp.len() < pos + MARK_LENGTH + MAC_LENGTH {
            return Ok(Parse::NeedMore);
        }

        // Validate the MAC with the epoch hour recorded at send time; the
        // client is authoritative on its own clock.
        let mac_expected = hmac256(
            self.server_identity.as_bytes(),
            &[&resp[..pos + MARK_LENGTH], self.epoch_hour.as_bytes()],
        );
        let mac_received = &resp[pos + MARK_LENGTH..pos + MARK_LENGTH + MAC_LENGTH];
        if !bool::from(mac_expected.ct_eq(mac_received)) {
            return Err(Error::InvalidHandshake);
        }

        // Complete the handshake and authenticate the server.
        let server_public = self
            .server_representative
            .as_ref()
            .expect("representative extracted above")
            .to_public();
        let (key_seed, auth) = ntor::client_handshake(
            &self.keypair,
            &server_public,
            &self.server_identity,
            &self.node_id,
        )?;
        let received = self.server_auth.expect("auth extracted above");
        if !auth.ct_eq_bytes(&received) {
            return Err(Error::AuthMismatch);
        }

        Ok(Parse::Complete(ClientDone {
            consumed: pos + MARK_LENGTH + MAC_LENGTH,
            key_seed,
        }))
    }
}

/// Server handshake state.
///
/// Built as a one-shot context from the listener's long-term material; the
/// connection owns it for the duration of the handshake and drops it after,
/// so nothing retains the factory.
pub struct ServerHandshake {
    keypair: Keypair,
    node_id: NodeID,
    identity: Arc<Keypair>,
    filter: Arc<ReplayFilter>,
    server_auth: Option<Auth>,

    client_representative: Option<Representative>,
    client_mark: Option<[u8; MARK_LENGTH]>,
}

impl ServerHandshake {
    /// Create the server state around a pre-generated session keypair.
    ///
    /// # Panics
    ///
    /// Panics if the session keypair carries no Elligator2 representative.
    pub fn new(
        node_id: NodeID,
        identity: Arc<Keypair>,
        filter: Arc<ReplayFilter>,
        session_key: Keypair,
    ) -> Self {
        assert!(
            session_key.representative().is_some(),
            "server session keypair must be representable"
        );
        Self {
            keypair: session_key,
            node_id,
            identity,
            filter,
            server_auth: None,
            client_representative: None,
            client_mark: None,
        }
    }

    /// Attempt to parse the client's handshake message from the accumulated
    /// bytes.
    ///
    /// On success the whole buffer has been consumed; the client never sends
    /// anything after its MAC until it has seen the server's response.
    pub fn parse_client_handshake(&mut self, resp: &[u8]) -> Result<Parse<ServerDone>> {
        self.parse_client_handshake_at(unix_seconds(), resp)
    }

    fn parse_client_handshake_at(&mut self, now: i64, resp: &[u8]) -> Result<Parse<ServerDone>> {
        if resp.len() < CLIENT_MIN_HANDSHAKE_LENGTH {
            return Ok(Parse::NeedMore);
        }

        if self.client_representative.is_none() {
            let repr = Representative::from_bytes(&resp[0..REPRESENTATIVE_LENGTH])?;
            self.client_mark = Some(hmac256(
                self.identity.public().as_bytes(),
                &[repr.as_bytes()],
            ));
            self.client_representative = Some(repr);
        }

        let mark = self.client_mark.as_ref().expect("mark derived above");
        let pos = match find_mark(mark, resp, REPRESENTATIVE_LENGTH, MAX_HANDSHAKE_LENGTH) {
            Some(pos) => pos,
            None => {
                if resp.len() >= MAX_HANDSHAKE_LENGTH {
                    return Err(Error::InvalidHandshake);
                }
                return Ok(Parse::NeedMore);
            }
        };
        if resp.len() < pos + MARK_LENGTH + MAC_LENGTH {
            return Ok(Parse::NeedMore);
        }

        // Allow the epoch hour to be off by up to an hour in either
        // direction.
        let mac_received = &resp[pos + MARK_LENGTH..pos + MARK_LENGTH + MAC_LENGTH];
        let mut mac_found = false;
        for off in [0i64, -1, 1] {
            let epoch_hour = (now / 3600 + off).to_string();
            let mac_expected = hmac256(
                self.identity.public().as_bytes(),
                &[&resp[..pos + MARK_LENGTH], epoch_hour.as_bytes()],
            );
            if bool::from(mac_expected.ct_eq(mac_received)) {
                // The client either happened to generate an identical
                // session key and padding, or someone is replaying an old
                // handshake.
                if self.filter.test_and_set(now, mac_received) {
                    return Err(Error::Replayed);
                }
                mac_found = true;
                break;
            }
        }
        if !mac_found {
            return Err(Error::InvalidHandshake);
        }

        // The client must never send trailing garbage.
        if resp.len() != pos + MARK_LENGTH + MAC_LENGTH {
            return Err(Error::InvalidHandshake);
        }

        let client_public = self
            .client_representative
            .as_ref()
            .expect("representative extracted above")
            .to_public();
        let (key_seed, auth) =
            ntor::server_handshake(&client_public, &self.keypair, &self.identity, &self.node_id)?;
        self.server_auth = Some(auth);

        Ok(Parse::Complete(ServerDone { key_seed }))
    }

    /// Generate the handshake response.
    ///
    /// Only valid after [`ServerHandshake::parse_client_handshake`] returned
    /// `Complete`.
    pub fn generate_handshake(&mut self) -> Vec<u8> {
        self.generate_handshake_at(unix_seconds())
    }

    fn generate_handshake_at(&mut self, now: i64) -> Vec<u8> {
        let auth = self
            .server_auth
            .expect("generate_handshake requires a parsed client handshake");
        let repr = self
            .keypair
            .representative()
            .expect("checked at construction");
        let mark = hmac256(self.identity.public().as_bytes(), &[repr.as_bytes()]);

        let pad_len = SecureRandom::int_in_range(SERVER_MIN_PAD_LENGTH, SERVER_MAX_PAD_LENGTH);
        let mut buf =
            Vec::with_capacity(SERVER_MIN_HANDSHAKE_LENGTH + pad_len);
        buf.extend_from_slice(repr.as_bytes());
        buf.extend_from_slice(auth.as_bytes());
        buf.resize(buf.len() + pad_len, 0);
        SecureRandom::fill(&mut buf[REPRESENTATIVE_LENGTH + AUTH_LENGTH..]);
        buf.extend_from_slice(&mark);

        let epoch_hour = (now / 3600).to_string();
        let mac = hmac256(
            self.identity.public().as_bytes(),
            &[&buf, epoch_hour.as_bytes()],
        );
        buf.extend_from_slice(&mac);

        buf
    }
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is after the UNIX epoch")
        .as_secs() as i64
}

fn hmac256(key: &[u8], chunks: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

/// Locate `mark` in `buf[start_pos..max_pos]`, returning its absolute
/// offset.
fn find_mark(mark: &[u8; MARK_LENGTH], buf: &[u8], start_pos: usize, max_pos: usize) -> Option<usize> {
    let end_pos = buf.len().min(max_pos);
    if start_pos + MARK_LENGTH > end_pos {
        return None;
    }

    buf[start_pos..end_pos]
        .windows(MARK_LENGTH)
        .position(|window| window == mark.as_slice())
        .map(|pos| pos + start_pos)
}

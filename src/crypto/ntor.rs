//! The obfs4 ntor handshake primitives.
//!
//! This is Tor's one-way-authenticated ntor key agreement, run over
//! Curve25519 public keys that travel the wire as uniform Elligator2
//! representatives. Both sides derive a 32-byte `KEY_SEED` and an `AUTH`
//! tag proving key knowledge; the seed is expanded by [`kdf`] into frame
//! key material.
//!
//! Secret material (private keys, shared secrets, key seeds) is zeroized on
//! drop.

use base64::{engine::general_purpose::STANDARD, Engine};
use curve25519_elligator2::edwards::EdwardsPoint;
use curve25519_elligator2::montgomery::MontgomeryPoint;
use curve25519_elligator2::{MapToPointVariant, Randomized};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::random::SecureRandom;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of a node identifier in bytes.
pub const NODE_ID_LENGTH: usize = 20;
/// Length of a Curve25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;
/// Length of a Curve25519 private key in bytes.
pub const PRIVATE_KEY_LENGTH: usize = 32;
/// Length of an Elligator2 representative in bytes.
pub const REPRESENTATIVE_LENGTH: usize = 32;
/// Length of the ntor AUTH tag in bytes.
pub const AUTH_LENGTH: usize = 32;
/// Length of the ntor KEY_SEED in bytes.
pub const KEY_SEED_LENGTH: usize = 32;

const PROTO_ID: &[u8] = b"ntor-curve25519-sha256-1";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:key_verify";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// A 20-byte opaque node identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeID([u8; NODE_ID_LENGTH]);

impl NodeID {
    /// Create a node ID from raw bytes. Fails unless exactly 20 bytes are
    /// given.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; NODE_ID_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::arg(format!("invalid node ID length: {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Create a node ID from a standard base64 string.
    pub fn from_base64(s: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(s)
            .map_err(|e| Error::arg(format!("invalid base64 node ID: {}", e)))?;
        Self::new(&raw)
    }

    /// Encode the node ID as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }
}

/// A Curve25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::arg(format!("invalid public key length: {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Create a public key from a standard base64 string.
    pub fn from_base64(s: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(s)
            .map_err(|e| Error::arg(format!("invalid base64 public key: {}", e)))?;
        Self::from_bytes(&raw)
    }

    /// Encode the public key as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    fn point(&self) -> MontgomeryPoint {
        MontgomeryPoint(self.0)
    }
}

/// An Elligator2 representative of a Curve25519 public key.
///
/// Uniformly distributed over all 256-bit strings: the two high bits of the
/// last byte carry random tweak padding, which decoding clears before
/// inverting the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Representative([u8; REPRESENTATIVE_LENGTH]);

impl Representative {
    /// Create a representative from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; REPRESENTATIVE_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::arg(format!("invalid representative length: {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Invert the Elligator2 map, recovering the public key.
    pub fn to_public(&self) -> PublicKey {
        // The inverse map is total once the tweak bits are cleared, which
        // the Randomized variant does internally.
        let point = Option::<EdwardsPoint>::from(Randomized::from_representative(&self.0))
            .expect("representative inversion is total")
            .to_montgomery();
        PublicKey(point.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; REPRESENTATIVE_LENGTH] {
        &self.0
    }
}

/// A Curve25519 keypair, optionally carrying an Elligator2 representative.
///
/// Session keypairs are generated with a representative (rejection sampling
/// until the public key is representable, two tries expected); long-term
/// identity keypairs are not.
pub struct Keypair {
    private: Zeroizing<[u8; PRIVATE_KEY_LENGTH]>,
    public: PublicKey,
    representative: Option<Representative>,
}

impl Keypair {
    /// Generate a new keypair.
    ///
    /// When `elligator` is true the generation loops until the public key has
    /// a uniform random representative, and the keypair satisfies
    /// `representative.to_public() == public`.
    pub fn generate(elligator: bool) -> Self {
        if !elligator {
            let private: [u8; PRIVATE_KEY_LENGTH] = SecureRandom::bytes();
            let public = PublicKey(MontgomeryPoint::mul_base_clamped(private).0);
            return Self {
                private: Zeroizing::new(private),
                public,
                representative: None,
            };
        }

        loop {
            let private: [u8; PRIVATE_KEY_LENGTH] = SecureRandom::bytes();
            let tweak = SecureRandom::bytes::<1>()[0];
            let repr: Option<[u8; REPRESENTATIVE_LENGTH]> =
                Randomized::to_representative(&private, tweak).into();
            if let Some(repr) = repr {
                let public = PublicKey(Randomized::mul_base_clamped(private).to_montgomery().0);
                return Self {
                    private: Zeroizing::new(private),
                    public,
                    representative: Some(Representative(repr)),
                };
            }
        }
    }

    /// Reconstruct an identity keypair from a base64 private key.
    pub fn from_base64(private: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(private)
            .map_err(|e| Error::arg(format!("invalid base64 private key: {}", e)))?;
        let private: [u8; PRIVATE_KEY_LENGTH] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::arg(format!("invalid private key length: {}", raw.len())))?;
        let public = PublicKey(MontgomeryPoint::mul_base_clamped(private).0);
        Ok(Self {
            private: Zeroizing::new(private),
            public,
            representative: None,
        })
    }

    /// Encode the private key as standard base64.
    pub fn private_to_base64(&self) -> String {
        STANDARD.encode(*self.private)
    }

    /// Get the public key.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Get the Elligator2 representative, if this keypair carries one.
    pub fn representative(&self) -> Option<&Representative> {
        self.representative.as_ref()
    }

    fn diffie_hellman(&self, their_public: &PublicKey) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(their_public.point().mul_clamped(*self.private).0)
    }
}

/// The 32-byte output of the ntor key agreement, fed to [`kdf`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeySeed([u8; KEY_SEED_LENGTH]);

impl KeySeed {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SEED_LENGTH] {
        &self.0
    }
}

/// The 32-byte ntor authenticator proving key knowledge.
#[derive(Clone, Copy, Debug)]
pub struct Auth([u8; AUTH_LENGTH]);

impl Auth {
    /// Create an AUTH value from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; AUTH_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::arg(format!("invalid auth length: {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; AUTH_LENGTH] {
        &self.0
    }

    /// Compare against received bytes in constant time.
    pub fn ct_eq_bytes(&self, other: &[u8]) -> bool {
        if other.len() != AUTH_LENGTH {
            return false;
        }
        bool::from(self.0.ct_eq(other))
    }
}

/// Perform the client side of the ntor handshake.
///
/// `server_public` is the server's ephemeral key recovered from its
/// representative, `id_public` the server's long-term identity key.
pub fn client_handshake(
    keypair: &Keypair,
    server_public: &PublicKey,
    id_public: &PublicKey,
    node_id: &NodeID,
) -> Result<(KeySeed, Auth)> {
    let exp_ephemeral = keypair.diffie_hellman(server_public);
    let exp_identity = keypair.diffie_hellman(id_public);
    let ok = !is_degenerate(&exp_ephemeral) & !is_degenerate(&exp_identity);

    let (seed, auth) = ntor_common(
        &exp_ephemeral,
        &exp_identity,
        node_id,
        id_public,
        keypair.public(),
        server_public,
    );
    if !ok {
        return Err(Error::NtorFailed);
    }
    Ok((seed, auth))
}

/// Perform the server side of the ntor handshake.
///
/// `client_public` is the client's ephemeral key recovered from its
/// representative.
pub fn server_handshake(
    client_public: &PublicKey,
    keypair: &Keypair,
    id_keypair: &Keypair,
    node_id: &NodeID,
) -> Result<(KeySeed, Auth)> {
    let exp_ephemeral = keypair.diffie_hellman(client_public);
    let exp_identity = id_keypair.diffie_hellman(client_public);
    let ok = !is_degenerate(&exp_ephemeral) & !is_degenerate(&exp_identity);

    let (seed, auth) = ntor_common(
        &exp_ephemeral,
        &exp_identity,
        node_id,
        id_keypair.public(),
        client_public,
        keypair.public(),
    );
    if !ok {
        return Err(Error::NtorFailed);
    }
    Ok((seed, auth))
}

// secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
// KEY_SEED     = H(secret_input, t_key)
// verify       = H(secret_input, t_verify)
// AUTH         = H(verify | ID | B | Y | X | PROTOID | "Server", t_mac)
fn ntor_common(
    exp_ephemeral: &[u8; 32],
    exp_identity: &[u8; 32],
    node_id: &NodeID,
    id_public: &PublicKey,
    client_public: &PublicKey,
    server_public: &PublicKey,
) -> (KeySeed, Auth) {
    let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 6 + PROTO_ID.len()));
    secret_input.extend_from_slice(exp_ephemeral);
    secret_input.extend_from_slice(exp_identity);
    secret_input.extend_from_slice(node_id.as_bytes());
    secret_input.extend_from_slice(id_public.as_bytes());
    secret_input.extend_from_slice(client_public.as_bytes());
    secret_input.extend_from_slice(server_public.as_bytes());
    secret_input.extend_from_slice(PROTO_ID);

    let key_seed = KeySeed(hmac_digest(T_KEY, &secret_input));
    let verify = Zeroizing::new(hmac_digest(T_VERIFY, &secret_input));

    let mut auth_input = Vec::with_capacity(32 * 4 + PROTO_ID.len() + 26);
    auth_input.extend_from_slice(&*verify);
    auth_input.extend_from_slice(node_id.as_bytes());
    auth_input.extend_from_slice(id_public.as_bytes());
    auth_input.extend_from_slice(server_public.as_bytes());
    auth_input.extend_from_slice(client_public.as_bytes());
    auth_input.extend_from_slice(PROTO_ID);
    auth_input.extend_from_slice(b"Server");

    let auth = Auth(hmac_digest(T_MAC, &auth_input));

    (key_seed, auth)
}

fn hmac_digest(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn is_degenerate(shared: &[u8; 32]) -> bool {
    bool::from(shared.ct_eq(&[0u8; 32]))
}

/// Expand a KEY_SEED into `okm_len` bytes of key material via HKDF-SHA256.
pub fn kdf(key_seed: &KeySeed, okm_len: usize) -> Zeroizing<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(T_KEY), key_seed.as_bytes());
    let mut okm = Zeroizing::new(vec![0u8; okm_len]);
    hk.expand(M_EXPAND, &mut okm)
        .expect("okm_len is far below the HKDF output limit");
    okm
}

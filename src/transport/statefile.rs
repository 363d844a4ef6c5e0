//! Persisted bridge identity.
//!
//! A bridge's long-term material lives in `obfs4_state.json`: node ID,
//! identity keypair, and length-distribution seed, all base64. The file is
//! created with fresh randomness on first run, written atomically with mode
//! 0600, and treated as read-only thereafter. A companion
//! `obfs4_bridgeline.txt` carries a human-readable line for out-of-band
//! publication; the core never reads it back.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::drbg::Seed;
use crate::crypto::ntor::{Keypair, NodeID, NODE_ID_LENGTH};
use crate::error::{Error, Result};
use crate::transport::Args;

/// Name of the state file within the state directory.
pub const STATE_FILE: &str = "obfs4_state.json";

/// Name of the bridge line file within the state directory.
pub const BRIDGE_LINE_FILE: &str = "obfs4_bridgeline.txt";

pub(crate) const NODE_ID_ARG: &str = "node-id";
pub(crate) const PUBLIC_KEY_ARG: &str = "public-key";
pub(crate) const PRIVATE_KEY_ARG: &str = "private-key";
pub(crate) const SEED_ARG: &str = "drbg-seed";

#[derive(Serialize, Deserialize)]
struct JsonServerState {
    #[serde(rename = "node-id")]
    node_id: String,
    #[serde(rename = "private-key")]
    private_key: String,
    #[serde(rename = "public-key")]
    public_key: String,
    #[serde(rename = "drbg-seed")]
    drbg_seed: String,
}

/// A bridge's long-term identity and seed.
pub struct ServerState {
    pub(crate) node_id: NodeID,
    pub(crate) identity: Keypair,
    pub(crate) drbg_seed: Seed,
}

impl ServerState {
    /// Resolve server state from transport arguments.
    ///
    /// If `node-id`, `private-key`, and `drbg-seed` are all present in the
    /// arguments they are used directly. If all are absent, the state file
    /// in `state_dir` is loaded, being created with fresh randomness when
    /// missing. Anything in between is a misconfiguration.
    pub fn from_args(state_dir: &Path, args: &Args) -> Result<Self> {
        let node_id = args.get(NODE_ID_ARG);
        let private_key = args.get(PRIVATE_KEY_ARG);
        let seed = args.get(SEED_ARG);

        let js = match (node_id, private_key, seed) {
            (Some(node_id), Some(private_key), Some(seed)) => JsonServerState {
                node_id: node_id.clone(),
                private_key: private_key.clone(),
                public_key: String::new(),
                drbg_seed: seed.clone(),
            },
            (None, None, None) => Self::load_or_create(state_dir)?,
            (_, None, _) => {
                return Err(Error::state(format!("missing argument '{}'", PRIVATE_KEY_ARG)))
            }
            (None, _, _) => {
                return Err(Error::state(format!("missing argument '{}'", NODE_ID_ARG)))
            }
            (_, _, None) => return Err(Error::state(format!("missing argument '{}'", SEED_ARG))),
        };

        Ok(Self {
            node_id: NodeID::from_base64(&js.node_id)
                .map_err(|e| Error::state(e.to_string()))?,
            identity: Keypair::from_base64(&js.private_key)
                .map_err(|e| Error::state(e.to_string()))?,
            drbg_seed: Seed::from_base64(&js.drbg_seed)
                .map_err(|e| Error::state(e.to_string()))?,
        })
    }

    fn load_or_create(state_dir: &Path) -> Result<JsonServerState> {
        let path = state_dir.join(STATE_FILE);
        match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| Error::state(format!("corrupt state file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::create(state_dir),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Generate everything a bridge needs and persist it.
    fn create(state_dir: &Path) -> Result<JsonServerState> {
        let raw_id: [u8; NODE_ID_LENGTH] = crate::crypto::SecureRandom::bytes();
        let node_id = NodeID::new(&raw_id).expect("generated node ID has the right length");
        let identity = Keypair::generate(false);
        let drbg_seed = Seed::generate();

        let js = JsonServerState {
            node_id: node_id.to_base64(),
            private_key: identity.private_to_base64(),
            public_key: identity.public().to_base64(),
            drbg_seed: drbg_seed.to_base64(),
        };

        let encoded = serde_json::to_vec(&js).expect("state serialization cannot fail");
        write_private(&state_dir.join(STATE_FILE), &encoded)?;
        write_bridge_line(state_dir, &js)?;

        Ok(js)
    }
}

/// Write `contents` to `path` with mode 0600, atomically via a rename.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_bridge_line(state_dir: &Path, js: &JsonServerState) -> Result<()> {
    let contents = format!(
        "# obfs4 bridge line\n\
         #\n\
         # Generated from the current bridge state; editing it has no\n\
         # effect. Replace <IP ADDRESS> and <PORT> with the bridge's\n\
         # public endpoint before publication.\n\
         #\n\
         Bridge obfs4 <IP ADDRESS>:<PORT> node-id={} public-key={}\n",
        js.node_id, js.public_key
    );
    write_private(&state_dir.join(BRIDGE_LINE_FILE), contents.as_bytes())
}

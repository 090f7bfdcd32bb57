//! Durable node identity: a persisted ed25519 seed and the keys derived
//! from it.
//!
//! The seed is the only secret. Both the ed25519 signing pair and the libp2p
//! identity keypair are pure functions of it, so the whole identity is
//! reproducible from the key file alone. The file stores the seed as a
//! decimal byte array (`"seed": [12, 240, ...]`) for portability with the
//! other tooling that reads it.

use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use libp2p::identity;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    error::Error,
    fmt, fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// File name of the persisted identity inside the data directory.
pub const KEY_FILE_NAME: &str = "device-keypair.json";

/// Node identity material: persisted seed, timestamps, and derived keys.
#[derive(Debug, Clone)]
pub struct Keypair {
    /// 32-byte entropy root; the only field requiring durable secrecy.
    pub seed: [u8; SECRET_KEY_LENGTH],
    /// RFC 3339 creation time, preserved across reloads.
    pub created_at: String,
    /// RFC 3339 last-use time as recorded in the key file.
    pub last_used: String,
    /// Signing key derived from the seed.
    pub signing: SigningKey,
    /// Verifying key associated with `signing`.
    pub verifying: VerifyingKey,
    /// Libp2p identity keypair derived from the same seed.
    pub libp2p: identity::Keypair,
}

/// Errors reported while loading, deriving, or persisting key material.
#[derive(Debug, Clone)]
pub enum KeyError {
    /// Underlying filesystem I/O failure.
    Io(String),
    /// JSON or ed25519 parsing failure.
    Decode(String),
    /// Stored seed did not match the expected length.
    InvalidLength(usize),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "key I/O error: {err}"),
            Self::Decode(err) => write!(f, "key decode error: {err}"),
            Self::InvalidLength(len) => write!(f, "unexpected seed length: {len}"),
        }
    }
}

impl Error for KeyError {}

/// On-disk schema of the key file. The seed is a decimal byte array rather
/// than raw binary or base64.
#[derive(Serialize, Deserialize)]
struct StoredKeypair {
    seed: Vec<u8>,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(rename = "lastUsed")]
    last_used: String,
}

impl Keypair {
    /// Loads the identity from `dir`, generating and persisting a fresh one
    /// when no key file exists yet.
    ///
    /// An existing file that cannot be read or parsed is an error: the
    /// process must not proceed under an accidental new identity.
    pub fn load_or_generate(dir: &Path) -> Result<Keypair, KeyError> {
        let path = dir.join(KEY_FILE_NAME);
        if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|err| KeyError::Io(err.to_string()))?;
            let stored: StoredKeypair =
                serde_json::from_str(&contents).map_err(|err| KeyError::Decode(err.to_string()))?;
            let kp = Keypair::from_seed_slice(&stored.seed, stored.created_at, stored.last_used)?;
            println!("SIGHT|mod=KEY|evt=LOADED|path={}", path.display());
            Ok(kp)
        } else {
            let mut seed = [0u8; SECRET_KEY_LENGTH];
            OsRng.fill_bytes(&mut seed);
            let now = rfc3339_utc(unix_seconds());
            let kp = Keypair::from_seed(seed, now.clone(), now)?;
            kp.persist(&path)?;
            println!("SIGHT|mod=KEY|evt=GENERATED|path={}", path.display());
            Ok(kp)
        }
    }

    /// Derives the full identity from a 32-byte seed.
    pub fn from_seed(
        seed: [u8; SECRET_KEY_LENGTH],
        created_at: String,
        last_used: String,
    ) -> Result<Keypair, KeyError> {
        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();
        let secret = identity::ed25519::SecretKey::try_from_bytes(seed)
            .map_err(|err| KeyError::Decode(err.to_string()))?;
        let libp2p = identity::Keypair::from(identity::ed25519::Keypair::from(secret));
        Ok(Keypair {
            seed,
            created_at,
            last_used,
            signing,
            verifying,
            libp2p,
        })
    }

    fn from_seed_slice(
        seed: &[u8],
        created_at: String,
        last_used: String,
    ) -> Result<Keypair, KeyError> {
        if seed.len() != SECRET_KEY_LENGTH {
            return Err(KeyError::InvalidLength(seed.len()));
        }
        let mut buf = [0u8; SECRET_KEY_LENGTH];
        buf.copy_from_slice(seed);
        Keypair::from_seed(buf, created_at, last_used)
    }

    /// Fixed identity used by gateway-mode nodes. Gateways share one
    /// well-known keypair instead of a per-device identity.
    pub fn gateway() -> Result<Keypair, KeyError> {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        seed[0] = 32;
        let now = rfc3339_utc(unix_seconds());
        Keypair::from_seed(seed, now.clone(), now)
    }

    /// Raw 32-byte ed25519 public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    /// Writes the key file atomically (temp file + rename), creating the
    /// directory tree when needed.
    fn persist(&self, path: &Path) -> Result<(), KeyError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| KeyError::Io(err.to_string()))?;
        }
        let stored = StoredKeypair {
            seed: self.seed.to_vec(),
            created_at: self.created_at.clone(),
            last_used: self.last_used.clone(),
        };
        let json =
            serde_json::to_string_pretty(&stored).map_err(|err| KeyError::Decode(err.to_string()))?;
        let tmp: PathBuf = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|err| KeyError::Io(err.to_string()))?;
        fs::rename(&tmp, path).map_err(|err| KeyError::Io(err.to_string()))
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Formats a unix timestamp as an RFC 3339 UTC string, e.g.
/// `2024-05-03T10:42:07Z`. Civil-date conversion per Howard Hinnant's
/// days-from-civil inverse.
pub fn rfc3339_utc(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (hh, mm, ss) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    format!("{year:04}-{month:02}-{day:02}T{hh:02}:{mm:02}:{ss:02}Z")
}

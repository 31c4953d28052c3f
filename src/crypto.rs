use blake2::{Blake2s256, Digest};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TOKEN_SIZE: usize = 32;
pub const HASH_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Public identity of a validator or wallet (ed25519 verifying key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token(pub [u8; TOKEN_SIZE]);

/// 256-bit blake2s digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_SIZE]);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0; HASH_SIZE]);

    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Blake2s256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Hash of the concatenation of `parts`.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Blake2s256::new();
        for part in parts {
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }
}

impl Token {
    pub const ZERO: Token = Token([0; TOKEN_SIZE]);

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify_strict(message, &sig).is_ok()
    }
}

impl Signature {
    pub const ZERO: Signature = Signature([0; SIGNATURE_SIZE]);
}

macro_rules! short_hex_debug {
    ($ty:ident) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($ty))?;
                for byte in &self.0[..4] {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "..)")
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0[..8] {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    };
}

short_hex_debug!(Token);
short_hex_debug!(Hash);
short_hex_debug!(Signature);

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    token: Token,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let token = Token(signing_key.verifying_key().to_bytes());
        Self { signing_key, token }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("token", &self.token).finish()
    }
}

use std::error::Error;
use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::{FINGERPRINT_SIZE, HOSTKEY_SIZE, SEAL_OVERHEAD};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("hostkey is not a 32-byte public key")]
    BadKey,
    #[error("ciphertext shorter than the sealed box envelope")]
    TooShort,
    #[error("authenticated decryption failed")]
    Aead,
}

/// The local keypair. The hostkey file on disk holds the 32-byte x25519
/// secret key; the advertised hostkey is the derived public key.
pub struct Identity {
    secret: StaticSecret,
    hostkey: Vec<u8>,
}

impl Identity {
    /// Read the hostkey file once at startup. A file of the wrong size is a
    /// configuration error and should abort the process.
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        let raw = std::fs::read(path)
            .map_err(|e| format!("cannot read hostkey file {}: {}", path.display(), e))?;
        let seed: [u8; HOSTKEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
            format!(
                "hostkey file {} must hold exactly {} bytes, found {}",
                path.display(),
                HOSTKEY_SIZE,
                raw.len()
            )
        })?;
        Ok(Self::from_secret_bytes(seed))
    }

    pub fn from_secret_bytes(seed: [u8; HOSTKEY_SIZE]) -> Self {
        let secret = StaticSecret::from(seed);
        let hostkey = PublicKey::from(&secret).as_bytes().to_vec();
        Identity { secret, hostkey }
    }

    /// Fresh random identity, used by tests and key provisioning.
    pub fn generate() -> Self {
        Self::from_secret_bytes(rand::thread_rng().gen())
    }

    /// The public key bytes this peer advertises to others.
    pub fn hostkey(&self) -> &[u8] {
        &self.hostkey
    }

    pub fn fingerprint(&self) -> [u8; FINGERPRINT_SIZE] {
        fingerprint(&self.hostkey)
    }

    pub fn short_fingerprint(&self) -> u16 {
        short_fingerprint(&self.hostkey)
    }

    /// Open a sealed box addressed to this identity.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::TooShort);
        }
        let raw: [u8; HOSTKEY_SIZE] = sealed[..HOSTKEY_SIZE]
            .try_into()
            .map_err(|_| CryptoError::TooShort)?;
        let ephemeral_pub = PublicKey::from(raw);
        let shared = self.secret.diffie_hellman(&ephemeral_pub);
        let key = derive_seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), &self.hostkey);
        let cipher = ChaCha20Poly1305::new(&key);
        cipher
            .decrypt(&Nonce::default(), &sealed[HOSTKEY_SIZE..])
            .map_err(|_| CryptoError::Aead)
    }
}

/// SHA-256 digest of a hostkey's byte representation. Stable across
/// processes, used to identify a hop independent of its network address.
pub fn fingerprint(hostkey: &[u8]) -> [u8; FINGERPRINT_SIZE] {
    let mut hasher = Sha256::default();
    hasher.update(hostkey);
    hasher.finalize().into()
}

/// First two fingerprint bytes as a big-endian u16. This is the compact
/// addressing token carried in cleartext on every API_DATA frame.
pub fn short_fingerprint(hostkey: &[u8]) -> u16 {
    let digest = fingerprint(hostkey);
    u16::from_be_bytes([digest[0], digest[1]])
}

/// Seal a plaintext so that only the holder of the secret key matching
/// `hostkey` can open it.
///
/// # Construction
/// An ephemeral x25519 keypair is generated per message; its shared secret
/// with the recipient key feeds HKDF-SHA256, and the resulting single-use
/// key encrypts the plaintext with ChaCha20-Poly1305 under a zero nonce.
/// The output is the ephemeral public key followed by the ciphertext.
///
/// # Arguments
/// * `plaintext` - The bytes to protect, in practice a serialized frame
/// * `hostkey` - The recipient's advertised 32-byte public key
///
/// # Returns
/// The sealed box, `plaintext.len() + 48` bytes, or an error if the hostkey
/// is not a valid key
pub fn seal(plaintext: &[u8], hostkey: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let raw: [u8; HOSTKEY_SIZE] = hostkey.try_into().map_err(|_| CryptoError::BadKey)?;
    let recipient = PublicKey::from(raw);
    let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_seal_key(shared.as_bytes(), ephemeral_pub.as_bytes(), hostkey);
    let cipher = ChaCha20Poly1305::new(&key);
    let ciphertext = cipher
        .encrypt(&Nonce::default(), plaintext)
        .map_err(|_| CryptoError::Aead)?;
    let mut out = Vec::with_capacity(HOSTKEY_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend(ciphertext);
    Ok(out)
}

/// Derive the single-use encryption key for one sealed box. The salt binds
/// both public keys so a transplanted ephemeral key cannot decrypt.
fn derive_seal_key(shared: &[u8], ephemeral_pub: &[u8], recipient: &[u8]) -> Key {
    let mut salt = Vec::with_capacity(HOSTKEY_SIZE * 2);
    salt.extend_from_slice(ephemeral_pub);
    salt.extend_from_slice(recipient);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hkdf.expand(b"shallot-sealed-box", &mut key)
        .expect("32 bytes is a valid length for HKDF");
    Key::from(key)
}

// Testing Suite:
// - Fingerprint determinism and width
// - Seal/open round trip, wrong key, tampering, truncation
// - Hostkey validation edge cases

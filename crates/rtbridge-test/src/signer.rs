//! Ed25519 node signer

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use rtbridge_core::{BridgeResult, Hash, PublicKey};
use rtbridge_host::Signer;
use sha2::{Digest, Sha256};

/// In-memory ed25519 signer
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Ed25519Signer {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Ed25519Signer {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Domain-separated message: `context || message`.
fn signed_message(context: &[u8], message: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(context.len() + message.len());
    msg.extend_from_slice(context);
    msg.extend_from_slice(message);
    msg
}

impl Signer for Ed25519Signer {
    fn public(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, context: &[u8], message: &[u8]) -> BridgeResult<Bytes> {
        let signature = self.signing_key.sign(&signed_message(context, message));
        Ok(Bytes::copy_from_slice(&signature.to_bytes()))
    }
}

/// Check a signature produced by [`Ed25519Signer`].
pub fn verify_signature(public: &PublicKey, context: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(&public.0) else {
        return false;
    };
    let Ok(signature) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(&signed_message(context, message), &Signature::from_bytes(&signature))
        .is_ok()
}

/// SHA-256 of a raw transaction.
pub fn tx_hash(raw: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    Hash(hasher.finalize().into())
}

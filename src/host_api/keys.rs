//! Ed25519 signing on behalf of components. Keys and signatures are hex.

use crate::error::SupervisorError;
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

fn decode_hex(what: &str, value: &str) -> Result<Vec<u8>, SupervisorError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| SupervisorError::Validation(format!("{} is not valid hex: {}", what, e)))
}

fn parse_private_key(private_hex: &str) -> Result<SigningKey, SupervisorError> {
    let bytes: [u8; 32] = decode_hex("private key", private_hex)?
        .try_into()
        .map_err(|_| SupervisorError::Validation("private key must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn sign_explicit(msg_hex: &str, private_hex: &str) -> Result<String, SupervisorError> {
    let key = parse_private_key(private_hex)?;
    let msg = decode_hex("message", msg_hex)?;
    Ok(hex::encode(key.sign(&msg).to_bytes()))
}

/// Imported keys, scoped by the service that imported them.
#[derive(Default)]
pub struct KeyStore {
    keys: Mutex<HashMap<(String, String), SigningKey>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the key for `service` and returns its public key.
    pub fn import_key(&self, service: &str, private_hex: &str) -> Result<String, SupervisorError> {
        let key = parse_private_key(private_hex)?;
        let public = hex::encode(key.verifying_key().to_bytes());
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((service.to_string(), public.clone()), key);
        Ok(public)
    }

    pub fn sign(
        &self,
        service: &str,
        msg_hex: &str,
        public_hex: &str,
    ) -> Result<String, SupervisorError> {
        let msg = decode_hex("message", msg_hex)?;
        let public = public_hex.trim_start_matches("0x").to_ascii_lowercase();
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let key = keys
            .get(&(service.to_string(), public))
            .ok_or_else(|| {
                SupervisorError::NotFound(format!("no key {} imported by {}", public_hex, service))
            })?;
        Ok(hex::encode(key.sign(&msg).to_bytes()))
    }

    pub fn clear(&self) {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    const PRIVATE: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    fn verify(public_hex: &str, msg: &[u8], sig_hex: &str) -> bool {
        let public: [u8; 32] = hex::decode(public_hex).unwrap().try_into().unwrap();
        let sig: [u8; 64] = hex::decode(sig_hex).unwrap().try_into().unwrap();
        VerifyingKey::from_bytes(&public)
            .unwrap()
            .verify(msg, &Signature::from_bytes(&sig))
            .is_ok()
    }

    #[test]
    fn imported_keys_sign_for_their_service_only() {
        let store = KeyStore::new();
        let public = store.import_key("auth-sig", PRIVATE).unwrap();
        assert_eq!(
            public,
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"
        );

        let sig = store.sign("auth-sig", "cafe", &public).unwrap();
        assert!(verify(&public, &[0xca, 0xfe], &sig));

        assert!(matches!(
            store.sign("tokens", "cafe", &public),
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[test]
    fn explicit_signing_matches_imported() {
        let store = KeyStore::new();
        let public = store.import_key("x", PRIVATE).unwrap();
        assert_eq!(
            sign_explicit("00ff", PRIVATE).unwrap(),
            store.sign("x", "00ff", &public).unwrap()
        );
        assert!(sign_explicit("zz", PRIVATE).is_err());
        assert!(sign_explicit("00", "abcd").is_err());
    }
}

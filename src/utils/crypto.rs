//! # Signing and Verification
//!
//! Ed25519 signatures binding client identifiers and content hashes to the
//! update authority.
//!
//! The server owns a [`Signer`] whose key material is generated once and
//! persisted base64-encoded in a local file. Clients carry a [`Verifier`]
//! built from a public key embedded at build time, so a writable install
//! directory cannot be used to impersonate the server.
//!
//! Verification never raises: malformed signatures, wrong keys and tampered
//! payloads all come back as `false`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand_core::OsRng;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::error::{constants, ProtocolError, Result};

/// Signature length in bytes
pub const SIGNATURE_LEN: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Public key length in bytes
pub const PUBLIC_KEY_LEN: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

/// Public key embedded into client builds (base64), if provided at build time
pub const EMBEDDED_PUBLIC_KEY: Option<&str> = option_env!("SSPROTO_PUBLIC_KEY");

/// Server-side signing key
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Construct from raw secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| ProtocolError::KeyError(constants::ERR_INVALID_KEY_FILE.into()))?;
        let secret = Zeroizing::new(secret);
        Ok(Self {
            key: SigningKey::from_bytes(&secret),
        })
    }

    /// Load the key file at `path`, generating and persisting a new pair if absent
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let signer = Self::load(path)?;
            info!("Loaded signing key");
            return Ok(signer);
        }

        let signer = Self::generate();
        signer.save(path)?;
        info!(public_key = %signer.public_key_base64(), "Generated new signing key");
        Ok(signer)
    }

    /// Load a key file: base64 secret key on the first line, base64 public key on the second
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();

        let secret_line = Zeroizing::new(lines.next().transpose()?.ok_or_else(|| {
            ProtocolError::KeyError(constants::ERR_INVALID_KEY_FILE.into())
        })?);
        let public_line = lines.next().transpose()?.ok_or_else(|| {
            ProtocolError::KeyError(constants::ERR_INVALID_KEY_FILE.into())
        })?;

        let secret = Zeroizing::new(
            general_purpose::STANDARD
                .decode(secret_line.trim())
                .map_err(|e| ProtocolError::KeyError(format!("{}: {e}", constants::ERR_INVALID_KEY_FILE)))?,
        );
        let signer = Self::from_secret_bytes(&secret)?;

        let stored_public = general_purpose::STANDARD
            .decode(public_line.trim())
            .map_err(|e| ProtocolError::KeyError(format!("{}: {e}", constants::ERR_INVALID_KEY_FILE)))?;
        if stored_public.as_slice() != signer.key.verifying_key().as_bytes() {
            return Err(ProtocolError::KeyError(constants::ERR_KEY_MISMATCH.into()));
        }

        Ok(signer)
    }

    /// Persist the key pair, readable by the owner only
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;

        let secret = Zeroizing::new(general_purpose::STANDARD.encode(self.key.to_bytes()));
        writeln!(file, "{}", secret.as_str())?;
        writeln!(file, "{}", self.public_key_base64())?;
        file.sync_all()?;
        Ok(())
    }

    /// Sign an arbitrary-length payload
    pub fn sign(&self, payload: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        use ed25519_dalek::Signer as _;
        let signature = self.key.try_sign(payload).map_err(|e| {
            ProtocolError::SigningError(format!("{}: {e}", constants::ERR_SIGNING_FAILED))
        })?;
        Ok(signature.to_bytes())
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.public_key())
    }

    /// Verifier matching this signer
    pub fn verifier(&self) -> Verifier {
        Verifier {
            key: self.key.verifying_key(),
        }
    }
}

/// Client-side signature verifier bound to one trusted public key
#[derive(Clone, Debug)]
pub struct Verifier {
    key: VerifyingKey,
}

impl Verifier {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| ProtocolError::KeyError(constants::ERR_INVALID_PUBLIC_KEY.into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ProtocolError::KeyError(format!("{}: {e}", constants::ERR_INVALID_PUBLIC_KEY)))?;
        Ok(Self { key })
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::KeyError(format!("{}: {e}", constants::ERR_INVALID_PUBLIC_KEY)))?;
        Self::from_bytes(&bytes)
    }

    /// Verifier for the public key embedded at build time
    pub fn embedded() -> Option<Result<Self>> {
        EMBEDDED_PUBLIC_KEY.map(Self::from_base64)
    }

    /// Check `signature` over `payload`; every failure is reported as `false`
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            debug!("Malformed signature");
            return false;
        };
        self.key.verify_strict(payload, &signature).is_ok()
    }
}

/// Verify `signature` over `payload` against a raw public key
pub fn verify(payload: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    match Verifier::from_bytes(public_key) {
        Ok(verifier) => verifier.verify(payload, signature),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let signer = Signer::generate();
        let signature = signer.sign(b"identifier").unwrap();
        assert!(signer.verifier().verify(b"identifier", &signature));
        assert!(verify(b"identifier", &signature, &signer.public_key()));
    }

    #[test]
    fn failures_fold_into_false() {
        let signer = Signer::generate();
        let other = Signer::generate();
        let signature = signer.sign(b"payload").unwrap();

        // tampered payload
        assert!(!signer.verifier().verify(b"payloaD", &signature));
        // wrong key
        assert!(!other.verifier().verify(b"payload", &signature));
        // malformed signature
        assert!(!signer.verifier().verify(b"payload", &signature[..10]));
        // malformed key
        assert!(!verify(b"payload", &signature, &[1, 2, 3]));
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ss.key");

        let first = Signer::load_or_generate(&path).unwrap();
        let second = Signer::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let signature = second.sign(b"data").unwrap();
        assert!(first.verifier().verify(b"data", &signature));
    }

    #[test]
    fn mismatched_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ss.key");
        let a = Signer::generate();
        let b = Signer::generate();
        let content = format!(
            "{}\n{}\n",
            general_purpose::STANDARD.encode(a.key.to_bytes()),
            b.public_key_base64()
        );
        std::fs::write(&path, content).unwrap();

        assert!(matches!(Signer::load(&path), Err(ProtocolError::KeyError(_))));
    }

    #[test]
    fn truncated_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ss.key");
        std::fs::write(&path, "only-one-line\n").unwrap();
        assert!(Signer::load(&path).is_err());
    }

    #[test]
    fn verifier_from_base64() {
        let signer = Signer::generate();
        let verifier = Verifier::from_base64(&signer.public_key_base64()).unwrap();
        let signature = signer.sign(b"x").unwrap();
        assert!(verifier.verify(b"x", &signature));
        assert!(Verifier::from_base64("not base64 !!").is_err());
    }
}

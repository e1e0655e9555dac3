//! # Node Identity
//!
//! The overlay identity is an Ed25519 keypair; the [`PeerId`] is derived from its public
//! key and never changes for the life of the process, across any number of host resets.
//!
//! ## Key Material
//!
//! | Source | Format |
//! |--------|--------|
//! | [`KeySource::Hex`] | 64 hex characters (32-byte secret) |
//! | [`KeySource::File`] | same hex text in a file; created with a fresh key if missing |
//! | [`KeySource::Ephemeral`] | generated in memory |
//!
//! SECURITY: the secret is never logged. Only the derived `PeerId` is.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use libp2p::identity::Keypair;
use libp2p::PeerId;
use tracing::info;

use crate::error::{Error, Result};

/// Length of an Ed25519 secret key in bytes.
pub const SECRET_KEY_LEN: usize = 32;

#[derive(Clone, Debug)]
pub enum KeySource {
    Hex(String),
    File(PathBuf),
    Ephemeral,
}

/// Resolve a keypair from the configured source.
pub fn load_keypair(source: &KeySource) -> Result<Keypair> {
    let keypair = match source {
        KeySource::Hex(text) => keypair_from_hex(text)?,
        KeySource::File(path) => load_or_create(path)?,
        KeySource::Ephemeral => Keypair::generate_ed25519(),
    };
    info!(peer = %PeerId::from(keypair.public()), "loaded node identity");
    Ok(keypair)
}

pub fn keypair_from_hex(text: &str) -> Result<Keypair> {
    let mut bytes = hex::decode(text.trim())
        .map_err(|e| Error::Config(format!("private key is not valid hex: {e}")))?;
    if bytes.len() != SECRET_KEY_LEN {
        return Err(Error::Config(format!(
            "private key must be {} bytes ({} hex characters), got {} bytes",
            SECRET_KEY_LEN,
            SECRET_KEY_LEN * 2,
            bytes.len()
        )));
    }
    Keypair::ed25519_from_bytes(&mut bytes)
        .map_err(|e| Error::Config(format!("private key rejected: {e}")))
}

/// Hex encoding of the keypair's secret.
pub fn secret_hex(keypair: &Keypair) -> Result<String> {
    let ed = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| Error::Config(format!("only ed25519 identities are supported: {e}")))?;
    Ok(hex::encode(ed.secret().as_ref()))
}

fn load_or_create(path: &Path) -> Result<Keypair> {
    match fs::read_to_string(path) {
        Ok(text) => keypair_from_hex(&text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let keypair = Keypair::generate_ed25519();
            fs::write(path, secret_hex(&keypair)?).map_err(|e| {
                Error::Config(format!("cannot persist new key to {}: {e}", path.display()))
            })?;
            info!(path = %path.display(), "generated new identity key");
            Ok(keypair)
        }
        Err(e) => Err(Error::Config(format!("cannot read key file {}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_key_yields_stable_peer_id() {
        let secret = "11".repeat(SECRET_KEY_LEN);
        let a = keypair_from_hex(&secret).unwrap();
        let b = keypair_from_hex(&format!("  {secret}\n")).unwrap();
        assert_eq!(PeerId::from(a.public()), PeerId::from(b.public()));
    }

    #[test]
    fn bad_hex_is_a_config_error() {
        assert!(matches!(keypair_from_hex("zz"), Err(Error::Config(_))));
        assert!(matches!(keypair_from_hex("abcd"), Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_created_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let first = load_keypair(&KeySource::File(path.clone())).unwrap();
        assert!(path.exists());
        let second = load_keypair(&KeySource::File(path)).unwrap();

        assert_eq!(PeerId::from(first.public()), PeerId::from(second.public()));
    }

    #[test]
    fn secret_hex_round_trips() {
        let keypair = Keypair::generate_ed25519();
        let restored = keypair_from_hex(&secret_hex(&keypair).unwrap()).unwrap();
        assert_eq!(keypair.public(), restored.public());
    }

    #[test]
    fn ephemeral_keys_differ() {
        let a = load_keypair(&KeySource::Ephemeral).unwrap();
        let b = load_keypair(&KeySource::Ephemeral).unwrap();
        assert_ne!(a.public(), b.public());
    }
}

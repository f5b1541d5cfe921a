//! # Cryptographic Operations
//!
//! This module provides cryptographic functionality for SlyShare, including:
//! - Ed25519 node identity, whose public key is the peer id
//! - Per-access-level share keys derived from a share secret
//! - Self-signed TLS certificates used to encrypt sessions
//! - Channel-binding proofs that authenticate a TLS session with a share key
//!
//! Algorithms:
//! - Ed25519 for node identity (RFC 8032)
//! - BLAKE3 `derive_key` for share key derivation and keyed hashing for proofs
//! - TLS 1.3 (ECDHE) via rustls; certificates are not trusted, the share key is

use anyhow::Result;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::protocol::AccessLevel;

/// Cryptographic identity for a SlyShare node.
///
/// Each node has a unique Ed25519 key pair. The hex-encoded public key is the peer id
/// announced in session handshakes.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let mut csprng = OsRng {};
        let signing_key = SigningKey::generate(&mut csprng);

        Ok(Self { signing_key })
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate()?;
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let identity_file: IdentityFile = toml::from_str(&content)?;

        let signing_key = SigningKey::from_bytes(&identity_file.secret_key);

        Ok(Self { signing_key })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let identity_file = IdentityFile {
            secret_key: self.signing_key.to_bytes(),
        };

        let content = toml::to_string_pretty(&identity_file)?;
        std::fs::write(path, content)?;

        // Set restrictive permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn peer_id(&self) -> String {
        self.public_key_hex()
    }
}

/// Symmetric key proving possession of a share at one access level.
#[derive(Clone, PartialEq, Eq)]
pub struct ShareKey([u8; 32]);

impl ShareKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Key for the next weaker level. Holders of a stronger key can derive every
    /// weaker one, never the reverse.
    fn weaken(&self, to: AccessLevel) -> ShareKey {
        let context = match to {
            AccessLevel::ReadOnly => "slyshare 2024 share key read_only",
            AccessLevel::Untrusted => "slyshare 2024 share key untrusted",
            AccessLevel::Unknown | AccessLevel::ReadWrite => "slyshare 2024 share key other",
        };
        ShareKey(blake3::derive_key(context, &self.0))
    }
}

impl fmt::Debug for ShareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShareKey(..)")
    }
}

/// Fresh random share secret.
pub fn generate_share_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Key for `wanted` given a secret held at level `held`.
///
/// `None` when `wanted` is stronger than `held` or is [`AccessLevel::Unknown`].
pub fn derive_share_key(secret: &[u8; 32], held: AccessLevel, wanted: AccessLevel) -> Option<ShareKey> {
    if wanted > held || wanted == AccessLevel::Unknown {
        return None;
    }
    let mut level = held;
    let mut key = ShareKey(*secret);
    while level > wanted {
        level = level.weaker()?;
        key = key.weaken(level);
    }
    Some(key)
}

/// Self-signed certificate and PKCS#8 key used for the TLS layer of a share.
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_der", &format_args!("{} bytes", self.cert_der.len()))
            .finish()
    }
}

/// Generate a self-signed certificate for a share's TLS endpoint.
pub fn generate_tls_identity(share_id: &str) -> Result<TlsIdentity> {
    // ECDSA P-256 is the most widely supported key type for TLS 1.3
    let key_pair = rcgen::KeyPair::generate()?;

    let mut params = rcgen::CertificateParams::default();
    let dns_name = format!("{}.slyshare.local", share_id);
    params.subject_alt_names = vec![rcgen::SanType::DnsName(dns_name.try_into()?)];

    let mut distinguished_name = rcgen::DistinguishedName::new();
    let short_id: String = share_id.chars().take(8).collect();
    distinguished_name.push(rcgen::DnType::CommonName, format!("SlyShare-{}", short_id));
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key_pair)?;

    Ok(TlsIdentity {
        cert_der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
    })
}

/// Side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection and sends `start`.
    Initiator,
    /// Accepted the connection and owns the requested share.
    Acceptor,
}

impl Role {
    pub fn peer(&self) -> Role {
        match self {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Role::Initiator => b'I',
            Role::Acceptor => b'A',
        }
    }
}

/// Proof that `role` holds `key` on the TLS session identified by `exporter`.
pub fn channel_proof(key: &ShareKey, exporter: &[u8; 32], role: Role) -> [u8; 32] {
    let mut message = [0u8; 33];
    message[..32].copy_from_slice(exporter);
    message[32] = role.tag();
    *blake3::keyed_hash(key.as_bytes(), &message).as_bytes()
}

/// Constant-time check of a peer's channel proof.
pub fn verify_channel_proof(key: &ShareKey, exporter: &[u8; 32], role: Role, proof: &[u8; 32]) -> bool {
    blake3::Hash::from(channel_proof(key, exporter, role)) == blake3::Hash::from(*proof)
}

pub fn content_hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

//! Connection handshake.
//!
//! Four steps, initiator first:
//!
//! 1. **Hello**: versions, supported algorithm sets, a random nonce and
//!    random padding. Both sides intersect the sets deterministically.
//! 2. **Ephemeral exchange**: X25519 publics; when a KEM was negotiated the
//!    initiator's public key travels out and the responder answers with an
//!    encapsulated secret. Both derive the master secret (optionally mixed
//!    with the global shared secret) and install session keys.
//! 3. **Identity claim**: sealed under the fresh keys. Carries the identity,
//!    the long-term public key, and a signature over the digest of the full
//!    plaintext transcript plus the sender's role.
//! 4. **Extender advertisement**: the sorted unique set of enabled
//!    extenders, also sealed.
//!
//! Decoy messages may be interleaved during the plaintext phase; they share
//! the handshake framing, carry random payloads and are discarded on
//! receipt. The initiator may also sit out a random delay before its first
//! byte to decorrelate connection initiation from observable events.

use aegis_crypto::algorithms::{Algorithms, KemAlgorithm, SupportedAlgorithms};
use aegis_crypto::signatures::{self, SignatureAlgorithm};
use aegis_crypto::{exchange, hash, kdf};
use crate::error::{Error, Result};
use crate::frame::FrameCodec;
use crate::keymgr::{AsymmetricAlgorithm, KeyManager};
use crate::peer::connection::Connection;
use crate::peer::keystate::PeerKeys;
use crate::uuid::{Uuid, UuidType};
use crate::PROTOCOL_VERSION;
use aegis_transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HELLO_NONCE_SIZE: usize = 32;
const MAX_HELLO_PADDING: usize = 32;
const MIN_DECOY_PAYLOAD: usize = 16;
const MAX_DECOY_PAYLOAD: usize = 128;

/// Grace used when opening sealed handshake records (no previous key exists)
const NO_GRACE: Duration = Duration::ZERO;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello {
        versions: Vec<u32>,
        algorithms: SupportedAlgorithms,
        nonce: Vec<u8>,
        padding: Vec<u8>,
    },
    Ephemeral {
        exchange_public: Vec<u8>,
        kem_public: Option<Vec<u8>>,
        kem_ciphertext: Option<Vec<u8>>,
    },
    Identity {
        uuid: Uuid,
        public_key: Vec<u8>,
        signature: Vec<u8>,
    },
    ExtenderAdvertisement {
        extenders: Vec<Uuid>,
        /// What this side observes as the peer's source endpoint
        observed_endpoint: Option<Endpoint>,
    },
    Decoy {
        data: Vec<u8>,
    },
}

/// Parameters for one handshake run
pub struct HandshakeConfig {
    /// Our identity
    pub local_uuid: Uuid,
    /// Our long-term public signing key
    pub signing_public: Vec<u8>,
    /// Our long-term private signing key
    pub signing_private: Vec<u8>,
    /// Algorithm of the signing keypair
    pub signature_algorithm: SignatureAlgorithm,
    /// Algorithms we offer
    pub supported: SupportedAlgorithms,
    /// Optional pre-shared group secret mixed into the KDF
    pub global_shared_secret: Option<Vec<u8>>,
    /// Extenders we advertise
    pub local_extenders: Vec<Uuid>,
    /// Refuse peers whose identity is not in `allowed_peers`
    pub require_authentication: bool,
    /// Pre-registered peer identities
    pub allowed_peers: Vec<Uuid>,
    /// Upper bound of the random pre-handshake delay (initiator only)
    pub max_handshake_delay: Duration,
    /// Decoy frames we may emit
    pub max_num_decoy_messages: usize,
    /// Upper bound of the random gap between decoy frames
    pub max_decoy_message_interval: Duration,
    /// The peer's source endpoint as this side observes it
    pub observed_peer_endpoint: Option<Endpoint>,
}

/// Everything the peer record needs after a successful handshake
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// The negotiated quintuple
    pub algorithms: Algorithms,
    /// Installed symmetric key state, counters already advanced past the
    /// sealed handshake frames
    pub keys: PeerKeys,
    /// The peer's verified identity
    pub peer_uuid: Uuid,
    /// The peer's long-term public key
    pub peer_public_key: Vec<u8>,
    /// Extenders the peer advertises
    pub peer_extenders: Vec<Uuid>,
    /// What the peer observed as our source endpoint
    pub reported_local_endpoint: Option<Endpoint>,
}

fn encode(msg: &HandshakeMessage) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| Error::Failed(e.to_string().into()))
}

fn decode(bytes: &[u8]) -> Result<HandshakeMessage> {
    bincode::deserialize(bytes).map_err(|_| Error::failed("malformed handshake message"))
}

async fn send_plain(conn: &Connection, msg: &HandshakeMessage) -> Result<Vec<u8>> {
    let body = encode(msg)?;
    conn.send_bytes(&crate::frame::encode_plain_record(&body)?)
        .await?;
    Ok(body)
}

/// Receive the next non-decoy plaintext handshake message plus its raw bytes
async fn recv_plain(conn: &mut Connection) -> Result<(HandshakeMessage, Vec<u8>)> {
    loop {
        let body = conn.recv_plain_record().await?;
        match decode(&body)? {
            HandshakeMessage::Decoy { .. } => continue,
            msg => return Ok((msg, body)),
        }
    }
}

async fn send_sealed(conn: &Connection, keys: &mut PeerKeys, msg: &HandshakeMessage) -> Result<()> {
    let body = encode(msg)?;
    let (nonce, ciphertext) = keys.seal(&body)?;
    let record = FrameCodec::plain().wrap_record(&nonce, &ciphertext)?;
    conn.send_bytes(&record).await
}

async fn recv_sealed(conn: &mut Connection, keys: &mut PeerKeys) -> Result<HandshakeMessage> {
    loop {
        let record = conn.recv_wire_record().await?;
        let (plaintext, _) = keys.open(&record.nonce, &record.ciphertext, NO_GRACE)?;
        match decode(&plaintext)? {
            HandshakeMessage::Decoy { .. } => continue,
            msg => return Ok(msg),
        }
    }
}

async fn send_decoys(conn: &Connection, cfg: &HandshakeConfig) -> Result<()> {
    if cfg.max_num_decoy_messages == 0 {
        return Ok(());
    }
    let count = aegis_crypto::random::range(0, cfg.max_num_decoy_messages);
    for _ in 0..count {
        tokio::time::sleep(aegis_crypto::random::delay(cfg.max_decoy_message_interval)).await;
        let data = aegis_crypto::random::bytes(aegis_crypto::random::range(
            MIN_DECOY_PAYLOAD,
            MAX_DECOY_PAYLOAD,
        ));
        send_plain(conn, &HandshakeMessage::Decoy { data }).await?;
    }
    Ok(())
}

fn role_label(is_initiator: bool) -> &'static [u8] {
    if is_initiator {
        b"initiator"
    } else {
        b"responder"
    }
}

/// Run the handshake to completion.
///
/// The caller enforces the overall `max_handshake_duration` deadline by
/// wrapping this future in a timeout.
///
/// # Errors
///
/// - [`Error::AlgorithmMismatch`] when a slot has no common algorithm
/// - [`Error::AuthFailure`] for identity, signature or sealing failures
///   (including a mismatched global shared secret)
/// - [`Error::Disconnected`] when the transport goes away mid-handshake
pub async fn run(
    conn: &mut Connection,
    is_initiator: bool,
    cfg: &HandshakeConfig,
    keymgr: &KeyManager,
) -> Result<HandshakeOutcome> {
    if is_initiator && !cfg.max_handshake_delay.is_zero() {
        tokio::time::sleep(aegis_crypto::random::delay(cfg.max_handshake_delay)).await;
    }

    send_decoys(conn, cfg).await?;

    // --- Hello ---
    let local_nonce = aegis_crypto::random::bytes(HELLO_NONCE_SIZE);
    let hello = HandshakeMessage::Hello {
        versions: vec![PROTOCOL_VERSION],
        algorithms: cfg.supported.clone(),
        nonce: local_nonce.clone(),
        padding: aegis_crypto::random::bytes(aegis_crypto::random::range(0, MAX_HELLO_PADDING)),
    };
    let local_hello_bytes = send_plain(conn, &hello).await?;
    let (their_hello, their_hello_bytes) = recv_plain(conn).await?;
    let HandshakeMessage::Hello {
        versions: their_versions,
        algorithms: their_algorithms,
        nonce: their_nonce,
        ..
    } = their_hello
    else {
        return Err(Error::failed("expected Hello"));
    };

    if !their_versions.contains(&PROTOCOL_VERSION) {
        return Err(Error::failed("no common protocol version"));
    }
    let algorithms = cfg.supported.negotiate(&their_algorithms)?;

    send_decoys(conn, cfg).await?;

    // --- Ephemeral exchange ---
    let exchange_pair = keymgr.get_keys(AsymmetricAlgorithm::X25519).await?;
    let kem = algorithms.secondary_asymmetric;

    let (local_eph_bytes, their_eph_bytes, ecdh_shared, kem_shared);
    if is_initiator {
        let kem_pair = match AsymmetricAlgorithm::from_kem(kem) {
            Some(alg) => Some(keymgr.get_keys(alg).await?),
            None => None,
        };
        let msg = HandshakeMessage::Ephemeral {
            exchange_public: exchange_pair.public.clone(),
            kem_public: kem_pair.as_ref().map(|p| p.public.clone()),
            kem_ciphertext: None,
        };
        local_eph_bytes = send_plain(conn, &msg).await?;

        let (their_msg, bytes) = recv_plain(conn).await?;
        their_eph_bytes = bytes;
        let HandshakeMessage::Ephemeral {
            exchange_public,
            kem_ciphertext,
            ..
        } = their_msg
        else {
            return Err(Error::failed("expected Ephemeral"));
        };

        ecdh_shared = exchange::ecdh(&exchange_pair.private, &exchange_public)?;
        kem_shared = match (kem, kem_pair, kem_ciphertext) {
            (KemAlgorithm::None, ..) => None,
            (alg, Some(pair), Some(ct)) => {
                Some(exchange::kem_decapsulate(alg, &pair.private, &ct)?)
            }
            _ => return Err(Error::failed("missing KEM ciphertext")),
        };
    } else {
        let (their_msg, bytes) = recv_plain(conn).await?;
        their_eph_bytes = bytes;
        let HandshakeMessage::Ephemeral {
            exchange_public,
            kem_public,
            ..
        } = their_msg
        else {
            return Err(Error::failed("expected Ephemeral"));
        };

        let (kem_ciphertext, shared) = match kem {
            KemAlgorithm::None => (None, None),
            alg => {
                let peer_public = kem_public.ok_or(Error::failed("missing KEM public key"))?;
                let (ct, ss) = exchange::kem_encapsulate(alg, &peer_public)?;
                (Some(ct), Some(ss))
            }
        };
        kem_shared = shared;

        let msg = HandshakeMessage::Ephemeral {
            exchange_public: exchange_pair.public.clone(),
            kem_public: None,
            kem_ciphertext,
        };
        local_eph_bytes = send_plain(conn, &msg).await?;
        ecdh_shared = exchange::ecdh(&exchange_pair.private, &exchange_public)?;
    }

    // --- Key derivation ---
    // Canonical transcript: initiator hello, responder hello, initiator
    // ephemeral, responder ephemeral
    let mut transcript = Vec::new();
    let mut salt = Vec::new();
    if is_initiator {
        transcript.extend_from_slice(&local_hello_bytes);
        transcript.extend_from_slice(&their_hello_bytes);
        transcript.extend_from_slice(&local_eph_bytes);
        transcript.extend_from_slice(&their_eph_bytes);
        salt.extend_from_slice(&local_nonce);
        salt.extend_from_slice(&their_nonce);
    } else {
        transcript.extend_from_slice(&their_hello_bytes);
        transcript.extend_from_slice(&local_hello_bytes);
        transcript.extend_from_slice(&their_eph_bytes);
        transcript.extend_from_slice(&local_eph_bytes);
        salt.extend_from_slice(&their_nonce);
        salt.extend_from_slice(&local_nonce);
    }

    let master = kdf::derive_master_secret(
        algorithms.hash,
        &ecdh_shared[..],
        kem_shared.as_ref().map(|s| s.as_slice()),
        cfg.global_shared_secret.as_deref(),
    );
    let session = kdf::derive_session_keys(algorithms.hash, &master, &salt, is_initiator)?;
    let mut keys = PeerKeys::new(algorithms.symmetric);
    keys.install_initial(&session);

    // --- Identity claim ---
    let transcript_digest = hash::digest(algorithms.hash, &transcript);
    let mut to_sign = transcript_digest.clone();
    to_sign.extend_from_slice(role_label(is_initiator));
    let signature = signatures::sign(cfg.signature_algorithm, &cfg.signing_private, &to_sign)?;

    send_sealed(
        conn,
        &mut keys,
        &HandshakeMessage::Identity {
            uuid: cfg.local_uuid,
            public_key: cfg.signing_public.clone(),
            signature,
        },
    )
    .await?;

    let HandshakeMessage::Identity {
        uuid: peer_uuid,
        public_key: peer_public_key,
        signature: peer_signature,
    } = recv_sealed(conn, &mut keys).await?
    else {
        return Err(Error::failed("expected Identity"));
    };

    if peer_uuid.uuid_type() != UuidType::Peer || !peer_uuid.verify(&peer_public_key) {
        tracing::warn!(peer = %peer_uuid, "peer identity not derivable from claimed key");
        return Err(Error::AuthFailure);
    }
    let peer_sig_alg = peer_uuid
        .signature_algorithm()
        .ok_or(Error::AuthFailure)?;
    let mut peer_signed = transcript_digest;
    peer_signed.extend_from_slice(role_label(!is_initiator));
    signatures::verify(peer_sig_alg, &peer_public_key, &peer_signed, &peer_signature)
        .map_err(|_| Error::AuthFailure)?;

    if cfg.require_authentication && !cfg.allowed_peers.contains(&peer_uuid) {
        tracing::warn!(peer = %peer_uuid, "peer identity not pre-registered");
        return Err(Error::AuthFailure);
    }

    // --- Extender advertisement ---
    let mut local_extenders = cfg.local_extenders.clone();
    local_extenders.sort_unstable();
    local_extenders.dedup();
    send_sealed(
        conn,
        &mut keys,
        &HandshakeMessage::ExtenderAdvertisement {
            extenders: local_extenders,
            observed_endpoint: cfg.observed_peer_endpoint,
        },
    )
    .await?;

    let HandshakeMessage::ExtenderAdvertisement {
        extenders: peer_extenders,
        observed_endpoint: reported_local_endpoint,
    } = recv_sealed(conn, &mut keys).await?
    else {
        return Err(Error::failed("expected ExtenderAdvertisement"));
    };

    tracing::debug!(peer = %peer_uuid, ?algorithms, "handshake complete");

    Ok(HandshakeOutcome {
        algorithms,
        keys,
        peer_uuid,
        peer_public_key,
        peer_extenders,
        reported_local_endpoint,
    })
}

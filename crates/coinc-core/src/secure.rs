//! Hybrid-encrypted channel state: RSA-2048 key exchange, AES-256-GCM
//! framing, and challenge–response authentication against a pre-shared key.
//!
//! One instance per connection. The handshake populates the session key and
//! the authenticated flag; after that the state is effectively read-only and
//! every application message flows through [`encrypt`]/[`decrypt`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const RSA_BITS: usize = 2048;
const SESSION_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const TAG_BYTES: usize = 16;
const CHALLENGE_BYTES: usize = 16;

pub struct SecureChannel {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    peer_public_key: Option<RsaPublicKey>,
    cipher: Option<Aes256Gcm>,
    auth_nonce: Option<[u8; CHALLENGE_BYTES]>,
    authenticated: bool,
    psk: String,
}

impl SecureChannel {
    /// Generate a fresh RSA-2048 keypair for one connection's key exchange.
    pub fn new(psk: &str) -> Result<Self> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, RSA_BITS).context("RSA key generation failed")?;
        let public_key = RsaPublicKey::from(&private_key);
        tracing::debug!("secure channel initialized (RSA-2048 + AES-256-GCM)");
        Ok(Self {
            private_key,
            public_key,
            peer_public_key: None,
            cipher: None,
            auth_nonce: None,
            authenticated: false,
            psk: psk.to_string(),
        })
    }

    /// Our public key as SPKI PEM, for the PUBLIC_KEY handshake message.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .context("failed to encode public key")
    }

    pub fn set_peer_public_key(&mut self, pem: &str) -> Result<()> {
        let key =
            RsaPublicKey::from_public_key_pem(pem).context("invalid peer public key PEM")?;
        self.peer_public_key = Some(key);
        Ok(())
    }

    /// Server side: mint the AES-256 session key, install it locally, and
    /// return it encrypted under the peer's RSA key (base64, OAEP-SHA-256).
    pub fn generate_session_key(&mut self) -> Result<String> {
        let peer = self
            .peer_public_key
            .as_ref()
            .context("peer public key not set")?;
        let mut key = [0u8; SESSION_KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        let encrypted = peer
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)
            .context("RSA encryption of session key failed")?;
        self.install_session_key(&key);
        Ok(BASE64.encode(encrypted))
    }

    /// Client side: decrypt the received session key with our private key.
    pub fn receive_session_key(&mut self, encrypted_b64: &str) -> Result<()> {
        let encrypted = BASE64
            .decode(encrypted_b64)
            .context("session key is not valid base64")?;
        let key = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &encrypted)
            .context("RSA decryption of session key failed")?;
        if key.len() != SESSION_KEY_BYTES {
            bail!("session key has wrong length: {}", key.len());
        }
        self.install_session_key(&key);
        tracing::debug!("session key established");
        Ok(())
    }

    fn install_session_key(&mut self, key: &[u8]) {
        self.cipher = Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));
    }

    pub fn session_ready(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Client side marks itself authenticated once the handshake completes;
    /// the server side flips the flag in [`verify_auth_response`].
    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Encrypt one application message. Wire form is
    /// base64(nonce ‖ tag ‖ ciphertext); the caller appends the newline.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = self.cipher.as_ref().context("session key not established")?;
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow::anyhow!("AES-GCM encryption failed"))?;
        // The AEAD yields ciphertext ‖ tag; the wire wants the tag up front.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_BYTES);
        let mut package = Vec::with_capacity(NONCE_BYTES + TAG_BYTES + body.len());
        package.extend_from_slice(&nonce);
        package.extend_from_slice(tag);
        package.extend_from_slice(body);
        Ok(BASE64.encode(package))
    }

    /// Decrypt one wire frame (without its trailing newline). A failure here
    /// means tampering or key corruption; the caller must treat the channel
    /// as unhealthy.
    pub fn decrypt(&self, frame: &str) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().context("session key not established")?;
        let package = BASE64.decode(frame.trim()).context("frame is not valid base64")?;
        if package.len() < NONCE_BYTES + TAG_BYTES {
            bail!("frame too short: {} bytes", package.len());
        }
        let (nonce, rest) = package.split_at(NONCE_BYTES);
        let (tag, body) = rest.split_at(TAG_BYTES);
        let mut sealed = Vec::with_capacity(body.len() + TAG_BYTES);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
            .map_err(|_| anyhow::anyhow!("AES-GCM authentication failed"))
    }

    /// Server side: mint the random challenge nonce (returned as base64).
    pub fn create_auth_challenge(&mut self) -> String {
        let mut nonce = [0u8; CHALLENGE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        self.auth_nonce = Some(nonce);
        BASE64.encode(nonce)
    }

    /// Client side: answer a challenge with SHA-256(PSK ‖ nonce).
    pub fn create_auth_response(&self, challenge_b64: &str) -> Result<String> {
        let nonce = BASE64
            .decode(challenge_b64)
            .context("challenge is not valid base64")?;
        let mut hasher = Sha256::new();
        hasher.update(self.psk.as_bytes());
        hasher.update(&nonce);
        Ok(BASE64.encode(hasher.finalize()))
    }

    /// Server side: constant-time comparison of the peer's response against
    /// the expected digest. Flips the authenticated flag on success.
    pub fn verify_auth_response(&mut self, response_b64: &str) -> Result<bool> {
        let nonce = self.auth_nonce.context("no outstanding challenge")?;
        let response = BASE64
            .decode(response_b64)
            .context("auth response is not valid base64")?;
        let mut hasher = Sha256::new();
        hasher.update(self.psk.as_bytes());
        hasher.update(nonce);
        let expected = hasher.finalize();
        let ok: bool = expected.as_slice().ct_eq(&response).into();
        self.authenticated = ok;
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the key-exchange part of the handshake between two channels.
    fn establish(psk_server: &str, psk_client: &str) -> (SecureChannel, SecureChannel) {
        let mut server = SecureChannel::new(psk_server).unwrap();
        let mut client = SecureChannel::new(psk_client).unwrap();
        server
            .set_peer_public_key(&client.public_key_pem().unwrap())
            .unwrap();
        client
            .set_peer_public_key(&server.public_key_pem().unwrap())
            .unwrap();
        let encrypted = server.generate_session_key().unwrap();
        client.receive_session_key(&encrypted).unwrap();
        (server, client)
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (server, client) = establish("swap", "swap");
        let msg = br#"{"command":"HEARTBEAT"}"#;
        let frame = server.encrypt(msg).unwrap();
        assert_eq!(client.decrypt(&frame).unwrap(), msg);
        // And the other direction under the same session key.
        let frame = client.encrypt(b"hello").unwrap();
        assert_eq!(server.decrypt(&frame).unwrap(), b"hello");
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let (server, client) = establish("swap", "swap");
        let frame = server.encrypt(b"payload").unwrap();
        let mut package = BASE64.decode(&frame).unwrap();
        let last = package.len() - 1;
        package[last] ^= 0x01;
        let tampered = BASE64.encode(package);
        assert!(client.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_wire_layout_nonce_tag_body() {
        let (server, _client) = establish("swap", "swap");
        let frame = server.encrypt(b"x").unwrap();
        let package = BASE64.decode(&frame).unwrap();
        // 12-byte nonce + 16-byte tag + 1 ciphertext byte.
        assert_eq!(package.len(), NONCE_BYTES + TAG_BYTES + 1);
    }

    #[test]
    fn test_auth_challenge_response() {
        let (mut server, client) = establish("correct-horse", "correct-horse");
        let challenge = server.create_auth_challenge();
        let response = client.create_auth_response(&challenge).unwrap();
        assert!(server.verify_auth_response(&response).unwrap());
        assert!(server.is_authenticated());
    }

    #[test]
    fn test_wrong_psk_rejected() {
        let (mut server, client) = establish("right", "wrong");
        let challenge = server.create_auth_challenge();
        let response = client.create_auth_response(&challenge).unwrap();
        assert!(!server.verify_auth_response(&response).unwrap());
        assert!(!server.is_authenticated());
    }

    #[test]
    fn test_encrypt_without_session_key_fails() {
        let channel = SecureChannel::new("psk").unwrap();
        assert!(channel.encrypt(b"nope").is_err());
        assert!(channel.decrypt("bm9wZQ==").is_err());
    }
}

//! Shadowsocks AEAD tunnel (chacha20-ietf-poly1305).
//!
//! Key schedule: the master key is derived from the password with a
//! SHA-256 chain; each direction starts with a random salt and runs on
//! an HKDF-SHA1 session subkey (`info = "ss-subkey"`). Payloads travel
//! as AEAD chunks with an encrypted 2-byte length prefix.

pub mod codec;

use std::time::Duration;

use async_trait::async_trait;
use hkdf::Hkdf;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use passage_core::addr::{Address, Network};
use passage_core::contract::{Connector, ConnectorOptions, Stream};
use passage_core::error::{Error, Result};

use crate::socks;
use codec::AeadStream;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;

/// Password to master key, SHA-256 chained and truncated.
pub fn derive_master_key(password: &str) -> [u8; KEY_LEN] {
    let mut key = Vec::with_capacity(KEY_LEN);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < KEY_LEN {
        let mut hasher = Sha256::new();
        if !prev.is_empty() {
            hasher.update(&prev);
        }
        hasher.update(password.as_bytes());
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&key[..KEY_LEN]);
    out
}

/// Per-direction session subkey.
pub fn session_subkey(master: &[u8; KEY_LEN], salt: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha1>::new(Some(salt), master);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(b"ss-subkey", &mut okm)
        .expect("okm length fits sha1 hkdf");
    okm
}

/// Client side of the shadowsocks tunnel: wraps the hop connection in
/// the AEAD stream and sends the target address as the first payload.
///
/// Metadata: `password` (required), `connectTimeout`.
pub struct SsConnector {
    master: [u8; KEY_LEN],
    connect_timeout: Duration,
}

impl SsConnector {
    pub fn new(opts: &ConnectorOptions) -> Result<Self> {
        let password = match &opts.auth {
            Some(creds) if !creds.password.is_empty() => creds.password.clone(),
            _ => {
                let p = opts.metadata.get_string("password");
                if p.is_empty() {
                    return Err(Error::Protocol("shadowsocks needs a password".into()));
                }
                p
            }
        };
        Ok(Self {
            master: derive_master_key(&password),
            connect_timeout: opts.metadata.get_duration("connectTimeout"),
        })
    }

    async fn establish(&self, stream: Stream, target: &Address) -> Result<Stream> {
        let mut stream = AeadStream::new(stream, self.master);
        let mut header = Vec::new();
        socks::encode_addr(&mut header, target)?;
        stream.write_all(&header).await?;
        stream.flush().await?;
        debug!(target = %target, "shadowsocks tunnel opened");
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Connector for SsConnector {
    async fn connect(&self, stream: Stream, network: Network, target: &Address) -> Result<Stream> {
        if network == Network::Udp {
            return Err(Error::Unsupported("udp over the shadowsocks connector"));
        }
        if self.connect_timeout.is_zero() {
            return self.establish(stream, target).await;
        }
        tokio::time::timeout(self.connect_timeout, self.establish(stream, target))
            .await
            .map_err(|_| Error::timeout("shadowsocks connect"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_is_deterministic() {
        let a = derive_master_key("hunter2");
        let b = derive_master_key("hunter2");
        assert_eq!(a, b);
        assert_ne!(a, derive_master_key("hunter3"));
    }

    #[test]
    fn subkeys_differ_per_salt() {
        let master = derive_master_key("hunter2");
        let s1 = session_subkey(&master, &[1u8; SALT_LEN]);
        let s2 = session_subkey(&master, &[2u8; SALT_LEN]);
        assert_ne!(s1, s2);
    }
}

use std::fmt;
use std::io::{Read, Write};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::wire::{read_block, write_block};
use crate::{Error, Result};

const KEY_CONTEXT: &str = "fanout v1 broker connection auth";
const NONCE_LEN: usize = 32;
const MAX_AUTH_BLOCK: u32 = 256;

const WELCOME: &[u8] = b"#WELCOME#";
const FAILURE: &[u8] = b"#FAILURE#";

/// The shared secret every broker connection must present.
///
/// The secret itself is an opaque byte string; on the wire only keyed
/// BLAKE3 MACs derived from it are exchanged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthKey(Vec<u8>);

impl AuthKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        AuthKey(secret.into())
    }

    /// A fresh random 32-byte key.
    pub fn generate() -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        AuthKey(secret)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn mac(&self, nonce: &[u8]) -> blake3::Hash {
        let key = blake3::derive_key(KEY_CONTEXT, &self.0);
        blake3::keyed_hash(&key, nonce)
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

/// Client half of the mutual challenge-response: answer the listener's
/// challenge, then challenge it back.
pub(crate) fn authenticate_client<S: Read + Write>(stream: &mut S, key: &AuthKey) -> Result<()> {
    answer_challenge(stream, key)?;
    deliver_challenge(stream, key)
}

/// Listener half: challenge the connecting peer, then answer its challenge.
pub(crate) fn authenticate_server<S: Read + Write>(stream: &mut S, key: &AuthKey) -> Result<()> {
    deliver_challenge(stream, key)?;
    answer_challenge(stream, key)
}

fn deliver_challenge<S: Read + Write>(stream: &mut S, key: &AuthKey) -> Result<()> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    write_block(stream, &nonce)?;

    let digest = read_block(stream, MAX_AUTH_BLOCK)?;
    // blake3::Hash comparison is constant-time.
    let accepted = match <[u8; 32]>::try_from(digest.as_slice()) {
        Ok(bytes) => blake3::Hash::from(bytes) == key.mac(&nonce),
        Err(_) => false,
    };
    if !accepted {
        let _ = write_block(stream, FAILURE);
        return Err(Error::Auth("digest mismatch"));
    }
    write_block(stream, WELCOME)
}

fn answer_challenge<S: Read + Write>(stream: &mut S, key: &AuthKey) -> Result<()> {
    let nonce = read_block(stream, MAX_AUTH_BLOCK)?;
    write_block(stream, key.mac(&nonce).as_bytes())?;
    let verdict = read_block(stream, MAX_AUTH_BLOCK)?;
    if verdict != WELCOME {
        return Err(Error::Auth("rejected by peer"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn run_handshake(client_key: AuthKey, server_key: AuthKey) -> (Result<()>, Result<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            authenticate_server(&mut stream, &server_key)
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        let client_result = authenticate_client(&mut stream, &client_key);
        (client_result, server.join().unwrap())
    }

    #[test]
    fn matching_keys_authenticate() {
        let key = AuthKey::generate();
        let (client, server) = run_handshake(key.clone(), key);
        assert!(client.is_ok());
        assert!(server.is_ok());
    }

    #[test]
    fn mismatched_keys_are_rejected() {
        let (client, server) = run_handshake(AuthKey::generate(), AuthKey::generate());
        assert!(matches!(client, Err(Error::Auth(_))));
        assert!(matches!(server, Err(Error::Auth(_))));
    }

    #[test]
    fn debug_does_not_leak_the_secret() {
        let key = AuthKey::new(b"super secret".to_vec());
        assert_eq!(format!("{key:?}"), "AuthKey(..)");
    }
}

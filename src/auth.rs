//! Nonce challenge/response key handshake, run over an application stream.
//!
//! The claimant proves possession of its key to the verifier:
//!
//! ```text
//! claimant                                   verifier
//!    |--- filler(1) ----------------------------->|
//!    |<-- ra(16) ---------------------------------|
//!    |--- rb(16) | key_len(4) | key | sig_len(4) | sig --->|
//! ```
//!
//! The signature covers `ra || rb || connection_id` (the id as 8 big-endian bytes), which binds
//! the proof to both nonces and to the session it was made in.

use bytes::{BufMut, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{
    Error, Key, PublicKey,
    codec::{read_array, read_exact},
};

/// Size of handshake nonces.
pub const NONCE_LEN: usize = 16;

/// Key and signature length fields above this are refused.
pub const MAX_FIELD_LEN: usize = 64 * 1024;

/// A 16-byte handshake nonce.
pub type Nonce = [u8; NONCE_LEN];

/// Generate a random nonce.
pub fn generate_nonce() -> Result<Nonce, Error> {
    let mut nonce = [0; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| Error::auth("cannot generate nonce"))?;
    Ok(nonce)
}

/// The message a claimant signs.
pub fn signed_content(ra: &Nonce, rb: &Nonce, connection_id: u64) -> Vec<u8> {
    let mut content = Vec::with_capacity(2 * NONCE_LEN + 8);
    content.extend_from_slice(ra);
    content.extend_from_slice(rb);
    content.extend_from_slice(&connection_id.to_be_bytes());
    content
}

/// The claimant's answer to a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyProof {
    /// The claimant's nonce.
    pub nonce: Nonce,

    /// The claimant's public key.
    pub key: PublicKey,

    /// Signature over `ra || rb || connection_id`.
    pub signature: Vec<u8>,
}

impl KeyProof {
    /// Answer the challenge `ra` with a fresh nonce, signed by `key`.
    pub fn sign(key: &Key, ra: &Nonce, connection_id: u64) -> Result<Self, Error> {
        let nonce = generate_nonce()?;
        let signature = key.sign(&signed_content(ra, &nonce, connection_id))?;
        Ok(Self {
            nonce,
            key: key.public_key(),
            signature,
        })
    }

    /// Check the proof against the challenge it answers.
    pub fn verify(&self, ra: &Nonce, connection_id: u64) -> Result<(), Error> {
        self.key
            .verify(&signed_content(ra, &self.nonce, connection_id), &self.signature)
    }

    /// Encode as `rb | key_len | key | sig_len | sig`.
    pub fn encode(&self) -> BytesMut {
        let key = self.key.encode();
        let mut buf = BytesMut::with_capacity(NONCE_LEN + 8 + key.len() + self.signature.len());
        buf.put_slice(&self.nonce);
        buf.put_u32(key.len() as u32);
        buf.put_slice(&key);
        buf.put_u32(self.signature.len() as u32);
        buf.put_slice(&self.signature);
        buf
    }

    /// Write the proof to a stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a proof from a stream.
    ///
    /// Any short read is an authentication failure.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let nonce = read_array(reader).await.map_err(short)?;
        let key = read_field(reader).await?;
        let key = PublicKey::decode(&key)?;
        let signature = read_field(reader).await?;
        Ok(Self {
            nonce,
            key,
            signature,
        })
    }
}

async fn read_field<R>(reader: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let len = u32::from_be_bytes(read_array(reader).await.map_err(short)?) as usize;
    if len > MAX_FIELD_LEN {
        return Err(Error::auth(format!("handshake field of {len} bytes is too large")));
    }

    let mut field = vec![0; len];
    read_exact(reader, &mut field).await.map_err(short)?;
    Ok(field)
}

fn short(err: Error) -> Error {
    match err {
        Error::IncompleteRead { expected, got } => {
            Error::auth(format!("short read: expected {expected} bytes, got {got}"))
        }
        other => other,
    }
}

/// Prove possession of `key` to the peer (claimant side).
///
/// Writes a filler byte first, as the peer only sees the stream once data arrives on it.
pub async fn serve_key<W, R>(
    send: &mut W,
    recv: &mut R,
    key: &Key,
    connection_id: u64,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    debug!("serving key");
    send.write_all(&[0]).await?;
    send.flush().await?;

    let ra: Nonce = read_array(recv).await.map_err(short)?;
    trace!("received challenge");
    KeyProof::sign(key, &ra, connection_id)?
        .write_to(send)
        .await
}

/// Challenge the peer to prove its key (verifier side), returning the verified key.
pub async fn ask_key<W, R>(
    send: &mut W,
    recv: &mut R,
    connection_id: u64,
) -> Result<PublicKey, Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    debug!("asking for key");
    let [_filler] = read_array::<_, 1>(recv).await.map_err(short)?;

    let ra = generate_nonce()?;
    send.write_all(&ra).await?;
    send.flush().await?;

    let proof = KeyProof::read_from(recv).await?;
    proof.verify(&ra, connection_id)?;
    debug!(key = %proof.key, "peer key verified");
    Ok(proof.key)
}

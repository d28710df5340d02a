use std::{fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rcgen::{CertificateParams, DistinguishedName as Dn, DnType, KeyPair};
use ring::{
    rand::SystemRandom,
    signature::{self as sig, EcdsaKeyPair, Ed25519KeyPair, UnparsedPublicKey},
};
use rustls::SignatureScheme;
use time::{Duration, OffsetDateTime};

use crate::Error;

/// A signature scheme for generating and using a [`Key`].
///
/// The tuple of the [rustls] type (numbering used on the wire) and the [rcgen] type (used to
/// generate keys and certificates).
pub type SigScheme = (SignatureScheme, &'static rcgen::SignatureAlgorithm);

/// Small keys using the [Ed25519](https://ed25519.cr.yp.to/) scheme.
pub const SIGSCHEME_ED25519: SigScheme = (SignatureScheme::ED25519, &rcgen::PKCS_ED25519);

/// Keys using ECDSA and the NIST P-256 curve.
pub const SIGSCHEME_ECDSA256: SigScheme = (
    SignatureScheme::ECDSA_NISTP256_SHA256,
    &rcgen::PKCS_ECDSA_P256_SHA256,
);

/// Keys using ECDSA and the NIST P-384 curve.
pub const SIGSCHEME_ECDSA384: SigScheme = (
    SignatureScheme::ECDSA_NISTP384_SHA384,
    &rcgen::PKCS_ECDSA_P384_SHA384,
);

pub(crate) const SUPPORTED_SCHEMES: [SigScheme; 3] =
    [SIGSCHEME_ED25519, SIGSCHEME_ECDSA256, SIGSCHEME_ECDSA384];

const CERT_TLD: &str = "quictun.invalid";

/// A key pair that identifies a peer, both in TLS and in the key handshake.
#[derive(Debug, Clone)]
pub struct Key {
    pub(crate) scheme: SigScheme,
    pub(crate) key: Arc<KeyPair>,

    /// How long certificates should be valid for. Defaults to 2 minutes.
    pub validity: Duration,
}

impl Key {
    /// Generate a new random key using the default scheme (Ed25519).
    pub fn generate() -> Result<Self, Error> {
        Self::generate_for(SIGSCHEME_ED25519)
    }

    /// Generate a new random key using a particular scheme.
    pub fn generate_for(scheme: SigScheme) -> Result<Self, Error> {
        Ok(Self {
            scheme,
            key: Arc::new(KeyPair::generate_for(scheme.1)?),
            validity: Duration::MINUTE * 2,
        })
    }

    /// Load a PKCS#8 PEM private key.
    ///
    /// The scheme is detected from the key; RSA and other unsupported algorithms are refused.
    pub fn from_pem(pem: &str) -> Result<Self, Error> {
        let key = KeyPair::from_pem(pem)?;
        let scheme = SUPPORTED_SCHEMES
            .into_iter()
            .find(|(_, alg)| key.algorithm() == *alg)
            .ok_or_else(|| Error::Config("unsupported key algorithm".into()))?;

        Ok(Self {
            scheme,
            key: Arc::new(key),
            validity: Duration::MINUTE * 2,
        })
    }

    /// Serialise the private key as PKCS#8 PEM.
    pub fn to_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// The signature scheme of this key.
    pub fn scheme(&self) -> SignatureScheme {
        self.scheme.0
    }

    /// The public half of this key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            scheme: self.scheme.0,
            raw: self.key.public_key_raw().to_vec(),
        }
    }

    /// Sign a message with this key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let pkcs8 = self.key.serialize_der();
        let rng = SystemRandom::new();
        let rejected = |e: ring::error::KeyRejected| Error::auth(format!("signing key rejected: {e}"));

        let signature = match self.scheme.0 {
            SignatureScheme::ED25519 => Ed25519KeyPair::from_pkcs8_maybe_unchecked(&pkcs8)
                .map_err(rejected)?
                .sign(message)
                .as_ref()
                .to_vec(),
            scheme => {
                let alg = match scheme {
                    SignatureScheme::ECDSA_NISTP256_SHA256 => &sig::ECDSA_P256_SHA256_ASN1_SIGNING,
                    SignatureScheme::ECDSA_NISTP384_SHA384 => &sig::ECDSA_P384_SHA384_ASN1_SIGNING,
                    _ => return Err(Error::Config(format!("cannot sign with {scheme:?}"))),
                };
                EcdsaKeyPair::from_pkcs8(alg, &pkcs8, &rng)
                    .map_err(rejected)?
                    .sign(&rng, message)
                    .map_err(|_| Error::auth("signing failed"))?
                    .as_ref()
                    .to_vec()
            }
        };

        Ok(signature)
    }

    /// Generate a self-signed certificate for this key.
    ///
    /// Certificates are made just-in-time for each TLS handshake; the actual trust decision is
    /// made on the public key.
    pub fn make_certificate(&self) -> Result<rcgen::Certificate, Error> {
        // some stacks balk if certificates don't have a SAN or DN, so derive a fake
        // SAN from the fingerprint of the public key. xn-- plus the punycode stays
        // within a 63-character DNS label
        let print = ring::digest::digest(&ring::digest::SHA256, &self.key.public_key_der());
        let puny = idna::punycode::encode_str(&base65536::encode(&print, None))
            .unwrap_or_else(|| "key".to_string());
        let san = format!("xn--{puny}.{CERT_TLD}");

        let mut cert = CertificateParams::new(vec![san.clone()])?;
        cert.distinguished_name = Dn::new();
        cert.distinguished_name.push(DnType::CommonName, san);

        // valid slightly in the past so peers with skewed clocks still agree
        let start = OffsetDateTime::now_utc() - Duration::MINUTE;
        cert.not_before = start;
        cert.not_after = start + Duration::MINUTE + self.validity;

        Ok(cert.self_signed(&self.key)?)
    }
}

// DER prefixes of SubjectPublicKeyInfo for the supported algorithms; the raw key follows.
const SPKI_ED25519: &[u8] = &[
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];
const SPKI_P256: &[u8] = &[
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
const SPKI_P384: &[u8] = &[
    0x30, 0x76, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05,
    0x2b, 0x81, 0x04, 0x00, 0x22, 0x03, 0x62, 0x00,
];

/// The public half of a peer key.
///
/// The portable encoding is the TLS signature scheme code (2 bytes, big-endian) followed by the
/// raw public key (the Ed25519 key or the uncompressed EC point). The text form used in trust
/// stores is the base64 of that encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    scheme: SignatureScheme,
    raw: Vec<u8>,
}

impl PublicKey {
    /// The signature scheme of this key.
    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// The raw public key bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Encode to the portable binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.raw.len());
        out.extend_from_slice(&u16::from(self.scheme).to_be_bytes());
        out.extend_from_slice(&self.raw);
        out
    }

    /// Decode the portable binary form.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let Some((code, raw)) = bytes.split_first_chunk::<2>() else {
            return Err(Error::auth("public key too short"));
        };
        let scheme = SignatureScheme::from(u16::from_be_bytes(*code));
        let expected = match scheme {
            SignatureScheme::ED25519 => 32,
            SignatureScheme::ECDSA_NISTP256_SHA256 => 65,
            SignatureScheme::ECDSA_NISTP384_SHA384 => 97,
            other => return Err(Error::auth(format!("unsupported key scheme {other:?}"))),
        };
        if raw.len() != expected {
            return Err(Error::auth(format!(
                "{scheme:?} key must be {expected} bytes, got {}",
                raw.len()
            )));
        }

        Ok(Self {
            scheme,
            raw: raw.to_vec(),
        })
    }

    /// Extract the key from a DER SubjectPublicKeyInfo, as found in certificates.
    pub fn from_spki(der: &[u8]) -> Option<Self> {
        [
            (SignatureScheme::ED25519, SPKI_ED25519),
            (SignatureScheme::ECDSA_NISTP256_SHA256, SPKI_P256),
            (SignatureScheme::ECDSA_NISTP384_SHA384, SPKI_P384),
        ]
        .into_iter()
        .find_map(|(scheme, prefix)| {
            der.strip_prefix(prefix).map(|raw| Self {
                scheme,
                raw: raw.to_vec(),
            })
        })
        .filter(|key| Self::decode(&key.encode()).is_ok())
    }

    /// Parse the base64 text form.
    pub fn from_base64(text: &str) -> Result<Self, Error> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| Error::auth(format!("bad key encoding: {e}")))?;
        Self::decode(&bytes)
    }

    /// The base64 text form.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.encode())
    }

    /// Verify a signature made by the private half of this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        let alg: &'static dyn sig::VerificationAlgorithm = match self.scheme {
            SignatureScheme::ED25519 => &sig::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256 => &sig::ECDSA_P256_SHA256_ASN1,
            SignatureScheme::ECDSA_NISTP384_SHA384 => &sig::ECDSA_P384_SHA384_ASN1,
            other => return Err(Error::auth(format!("unsupported key scheme {other:?}"))),
        };

        UnparsedPublicKey::new(alg, &self.raw)
            .verify(message, signature)
            .map_err(|_| Error::auth("signature verification failed"))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_base64()).finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

use std::sync::{Arc, LazyLock};

use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tracing::trace;

use crate::key::SUPPORTED_SCHEMES;

static PROVIDER: LazyLock<Arc<CryptoProvider>> = LazyLock::new(|| {
    let mut provider = rustls::crypto::ring::default_provider();
    let supported = |scheme| SUPPORTED_SCHEMES.iter().any(|(s, _)| *s == scheme);

    let mappings = Box::leak(
        provider
            .signature_verification_algorithms
            .mapping
            .iter()
            .filter(|(scheme, _)| supported(*scheme))
            .cloned()
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    let algos = Box::leak(
        mappings
            .iter()
            .flat_map(|(_, algs)| algs.iter().copied())
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    provider.signature_verification_algorithms = WebPkiSupportedAlgorithms {
        all: algos,
        mapping: mappings,
    };

    trace!(?provider, "tunnel crypto provider");
    Arc::new(provider)
});

/// The _ring_ [`CryptoProvider`] restricted to the key schemes tunnel peers may use.
///
/// Only Ed25519 and ECDSA P-256/P-384 signatures are verified; RSA is refused outright.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    PROVIDER.clone()
}

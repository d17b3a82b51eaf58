//! TLS client-hello fingerprint (JA3 shape).
//!
//! The cipher list, curves and signature algorithms are applied verbatim to
//! the BoringSSL context; GREASE and extension permutation are toggled through
//! BoringSSL directly.

/// Chrome 131 cipher suites in exact order.
pub const CHROME_131_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
];

/// Chrome 131 signature algorithms.
pub const CHROME_131_SIGNATURE_ALGORITHMS: &[&str] = &[
    "ecdsa_secp256r1_sha256",
    "rsa_pss_rsae_sha256",
    "rsa_pkcs1_sha256",
    "ecdsa_secp384r1_sha384",
    "rsa_pss_rsae_sha384",
    "rsa_pkcs1_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha512",
];

/// Chrome 131 supported groups.
pub const CHROME_131_CURVES: &[&str] = &["X25519", "P-256", "P-384"];

/// Chrome 131 extension IDs in wire order (before permutation).
pub const CHROME_131_EXTENSION_IDS: &[u16] =
    &[0, 23, 65281, 10, 11, 35, 16, 5, 13, 18, 51, 45, 43, 27, 21];

/// Certificate compression algorithm advertised in `compress_certificate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertCompression {
    #[default]
    None,
    Brotli,
    Zlib,
}

/// TLS fingerprint configuration.
#[derive(Debug, Clone)]
pub struct TlsFingerprint {
    /// Cipher suites in order.
    pub cipher_list: Vec<&'static str>,
    /// Signature algorithms.
    pub sigalgs: Vec<&'static str>,
    /// Supported curves/groups.
    pub curves: Vec<&'static str>,
    /// Extension IDs in reference order, used to compute the JA3 string.
    pub extension_order: Vec<u16>,
    /// Send GREASE values and permute extensions.
    pub grease: bool,
    /// Prepend the post-quantum X25519Kyber768 hybrid group.
    pub enable_kyber: bool,
    pub cert_compression: CertCompression,
}

impl Default for TlsFingerprint {
    fn default() -> Self {
        Self {
            cipher_list: vec![],
            sigalgs: vec![],
            curves: vec![],
            extension_order: vec![],
            grease: false,
            enable_kyber: false,
            cert_compression: CertCompression::None,
        }
    }
}

impl TlsFingerprint {
    /// Create a TLS fingerprint for Chrome 131.
    pub fn chrome_131() -> Self {
        Self {
            cipher_list: CHROME_131_CIPHER_SUITES.to_vec(),
            sigalgs: CHROME_131_SIGNATURE_ALGORITHMS.to_vec(),
            curves: CHROME_131_CURVES.to_vec(),
            extension_order: CHROME_131_EXTENSION_IDS.to_vec(),
            grease: true,
            enable_kyber: false,
            cert_compression: CertCompression::Brotli,
        }
    }

    /// Curves list as passed to BoringSSL, Kyber first when enabled.
    pub(crate) fn curves_list(&self) -> Option<String> {
        match (self.curves.is_empty(), self.enable_kyber) {
            (true, false) => None,
            (true, true) => Some("X25519Kyber768Draft00".to_string()),
            (false, true) => Some(format!("X25519Kyber768Draft00:{}", self.curves.join(":"))),
            (false, false) => Some(self.curves.join(":")),
        }
    }
}

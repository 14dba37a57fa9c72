//! Host keypair and self-signed certificate
//!
//! Generated once on first start and persisted with the rest of the state
//! file. Clients pin this certificate during pairing, so regenerating it
//! invalidates every paired client.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder, X509Ref};

use crate::error::Result;

const RSA_BITS: u32 = 2048;
const VALID_DAYS: u32 = 7300;

/// The host's RSA keypair and self-signed certificate.
pub struct HostIdentity {
    cert: X509,
    key: PKey<Private>,
    cert_pem: String,
    key_pem: String,
}

impl HostIdentity {
    /// Generate a fresh 2048-bit RSA key and a self-signed certificate
    /// with `common_name` as both subject and issuer CN.
    pub fn generate(common_name: &str) -> Result<Self> {
        let rsa = Rsa::generate(RSA_BITS)?;
        let key = PKey::from_rsa(rsa)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        let name = name.build();

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial_asn1 = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial_asn1)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        let not_before = Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::days_from_now(VALID_DAYS)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&key)?;
        builder.sign(&key, MessageDigest::sha256())?;
        let cert = builder.build();

        let cert_pem = String::from_utf8_lossy(&cert.to_pem()?).into_owned();
        let key_pem = String::from_utf8_lossy(&key.private_key_to_pem_pkcs8()?).into_owned();

        Ok(Self {
            cert,
            key,
            cert_pem,
            key_pem,
        })
    }

    /// Reload a persisted identity.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert = X509::from_pem(cert_pem.as_bytes())?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())?;
        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_owned(),
            key_pem: key_pem.to_owned(),
        })
    }

    pub fn cert(&self) -> &X509Ref {
        &self.cert
    }

    pub fn key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("subject", &self.cert.subject_name())
            .finish_non_exhaustive()
    }
}

use super::ConnectError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Transport security used to reach an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SecurityProfile {
    #[default]
    Plaintext,
    /// TLS verified against the system trust store.
    Tls,
    /// TLS without certificate verification.
    TlsSkipVerify,
}

impl SecurityProfile {
    /// Builds a profile from the `tls` / `insecure` flag pair. Disabling verification
    /// without TLS is rejected.
    pub fn from_flags(tls: bool, insecure: bool) -> Result<Self, ConnectError> {
        match (tls, insecure) {
            (false, false) => Ok(SecurityProfile::Plaintext),
            (true, false) => Ok(SecurityProfile::Tls),
            (true, true) => Ok(SecurityProfile::TlsSkipVerify),
            (false, true) => Err(ConnectError::InsecureWithoutTls),
        }
    }

    pub fn uses_tls(self) -> bool {
        !matches!(self, SecurityProfile::Plaintext)
    }

    pub fn skips_verification(self) -> bool {
        matches!(self, SecurityProfile::TlsSkipVerify)
    }

    fn scheme(self) -> &'static str {
        if self.uses_tls() { "https" } else { "http" }
    }
}

/// A server address plus the way to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "EndpointRecord", into = "EndpointRecord")]
pub struct Endpoint {
    address: String,
    security: SecurityProfile,
    deadline: Option<Duration>,
}

impl Endpoint {
    /// Creates an endpoint.
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port`, optionally prefixed with `http://` or `https://`. A scheme
    ///   must agree with `security`.
    /// * `security` - The security profile.
    pub fn new(address: impl AsRef<str>, security: SecurityProfile) -> Result<Self, ConnectError> {
        let raw = address.as_ref().trim();

        let address = if let Some(rest) = strip_scheme(raw, "https://") {
            if !security.uses_tls() {
                return Err(ConnectError::SchemeMismatch(raw.to_string(), "TLS"));
            }
            rest
        } else if let Some(rest) = strip_scheme(raw, "http://") {
            if security.uses_tls() {
                return Err(ConnectError::SchemeMismatch(raw.to_string(), "plaintext"));
            }
            rest
        } else {
            raw
        };

        let address = address.trim_end_matches('/');

        if address.is_empty() {
            return Err(ConnectError::EmptyAddress);
        }

        if address.contains("://") || address.contains('/') || address.chars().any(char::is_whitespace) {
            return Err(ConnectError::InvalidAddress(
                raw.to_string(),
                "expected host:port".to_string(),
            ));
        }

        Ok(Self {
            address: address.to_string(),
            security,
            deadline: None,
        })
    }

    pub fn plaintext(address: impl AsRef<str>) -> Result<Self, ConnectError> {
        Self::new(address, SecurityProfile::Plaintext)
    }

    /// Sets the dial deadline for this endpoint.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn security(&self) -> SecurityProfile {
        self.security
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// The URI handed to the transport, e.g. `https://api.example.com:443`.
    pub fn uri(&self) -> String {
        format!("{}://{}", self.security.scheme(), self.address)
    }

    /// Whether both endpoints point at the same server with the same TLS setting.
    pub fn same_target(&self, other: &Endpoint) -> bool {
        self.address.eq_ignore_ascii_case(&other.address)
            && self.security.uses_tls() == other.security.uses_tls()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())?;
        if self.security.skips_verification() {
            f.write_str(" (unverified)")?;
        }
        Ok(())
    }
}

fn strip_scheme<'a>(address: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = address.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &address[scheme.len()..])
}

/// On-disk form of an [`Endpoint`].
#[derive(Serialize, Deserialize)]
struct EndpointRecord {
    address: String,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline_ms: Option<u64>,
}

impl TryFrom<EndpointRecord> for Endpoint {
    type Error = ConnectError;

    fn try_from(record: EndpointRecord) -> Result<Self, Self::Error> {
        let security = SecurityProfile::from_flags(record.tls, record.insecure)?;
        let endpoint = Endpoint::new(&record.address, security)?;
        Ok(match record.deadline_ms {
            Some(ms) => endpoint.with_deadline(Duration::from_millis(ms)),
            None => endpoint,
        })
    }
}

impl From<Endpoint> for EndpointRecord {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            address: endpoint.address,
            tls: endpoint.security.uses_tls(),
            insecure: endpoint.security.skips_verification(),
            deadline_ms: endpoint.deadline.map(|d| d.as_millis() as u64),
        }
    }
}

//! Shared-access credentials and the token-minting capability.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BoxError, Error};

/// REST API version sent with every registry request.
pub const DEFAULT_API_VERSION: &str = "2018-06-30";

/// Mints signed access tokens.
///
/// Implementations typically compute a shared-access signature from
/// [`Credentials::shared_access_key`]; the crate only calls [`sign`](Self::sign).
pub trait TokenSource: Send + Sync {
    /// Produce a token authorising access to `resource` for `ttl`.
    fn sign(&self, resource: &str, ttl: Duration) -> Result<String, BoxError>;
}

impl<F> TokenSource for F
where
    F: Fn(&str, Duration) -> Result<String, BoxError> + Send + Sync,
{
    fn sign(&self, resource: &str, ttl: Duration) -> Result<String, BoxError> {
        self(resource, ttl)
    }
}

/// Hub identity and shared access policy.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host_name: String,
    pub shared_access_key_name: String,
    pub shared_access_key: String,
    pub api_version: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl Credentials {
    pub fn new(
        host_name: impl Into<String>,
        shared_access_key_name: impl Into<String>,
        shared_access_key: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            shared_access_key_name: shared_access_key_name.into(),
            shared_access_key: shared_access_key.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    /// Parse `HostName=…;SharedAccessKeyName=…;SharedAccessKey=…`.
    pub fn from_connection_string(cs: &str) -> Result<Self, Error> {
        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;
        for part in cs.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Keys are base64 and may end in '=', so split on the first one only.
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed connection string segment {part:?}")))?;
            match k {
                "HostName" => host_name = Some(v.to_string()),
                "SharedAccessKeyName" => key_name = Some(v.to_string()),
                "SharedAccessKey" => key = Some(v.to_string()),
                other => {
                    tracing::debug!(key = other, "ignoring connection string field");
                }
            }
        }
        let missing = |name: &str| Error::Config(format!("connection string is missing {name}"));
        let creds = Credentials::new(
            host_name.ok_or_else(|| missing("HostName"))?,
            key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key.ok_or_else(|| missing("SharedAccessKey"))?,
        );
        creds.validate()?;
        Ok(creds)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("host name", &self.host_name),
            ("shared access key name", &self.shared_access_key_name),
            ("shared access key", &self.shared_access_key),
            ("api version", &self.api_version),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("credentials: {name} is empty")));
            }
        }
        Ok(())
    }

    /// Hub name: the host name up to its first dot.
    pub fn hub_name(&self) -> &str {
        self.host_name
            .split_once('.')
            .map_or(self.host_name.as_str(), |(name, _)| name)
    }

    /// SASL PLAIN username for event endpoint discovery.
    pub(crate) fn redirect_username(&self) -> String {
        format!(
            "{}@sas.root.{}",
            self.shared_access_key_name,
            self.hub_name()
        )
    }
}

impl FromStr for Credentials {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_connection_string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CS: &str = "HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=c2VjcmV0a2V5PT0=";

    #[test]
    fn parse_connection_string() {
        let creds = Credentials::from_connection_string(CS).unwrap();
        assert_eq!(creds.host_name, "myhub.azure-devices.net");
        assert_eq!(creds.shared_access_key_name, "iothubowner");
        assert_eq!(creds.shared_access_key, "c2VjcmV0a2V5PT0=");
        assert_eq!(creds.api_version, DEFAULT_API_VERSION);

        let parsed: Credentials = CS.parse().unwrap();
        assert_eq!(parsed, creds);
    }

    #[test]
    fn parse_tolerates_trailing_separator_and_unknown_fields() {
        let cs = format!("{CS};DeviceId=ignored;");
        let creds = Credentials::from_connection_string(&cs).unwrap();
        assert_eq!(creds.hub_name(), "myhub");
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let err = Credentials::from_connection_string("HostName=h;SharedAccessKey=k").unwrap_err();
        assert!(err.to_string().contains("SharedAccessKeyName"));

        let err = Credentials::from_connection_string("HostName").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn parse_rejects_empty_values() {
        let err = Credentials::from_connection_string(
            "HostName=;SharedAccessKeyName=n;SharedAccessKey=k",
        )
        .unwrap_err();
        assert!(err.to_string().contains("host name is empty"));
    }

    #[test]
    fn redirect_username_uses_hub_name() {
        let creds = Credentials::new("myhub.azure-devices.net", "service", "k");
        assert_eq!(creds.redirect_username(), "service@sas.root.myhub");

        let bare = Credentials::new("localhub", "service", "k");
        assert_eq!(bare.redirect_username(), "service@sas.root.localhub");
    }

    #[test]
    fn debug_redacts_key() {
        let creds = Credentials::new("h", "n", "topsecret");
        assert!(!format!("{creds:?}").contains("topsecret"));
    }

    #[test]
    fn closures_are_token_sources() {
        let source = |resource: &str, ttl: Duration| -> Result<String, BoxError> {
            Ok(format!("sr={resource}&ttl={}", ttl.as_secs()))
        };
        let token = source.sign("h", Duration::from_secs(60)).unwrap();
        assert_eq!(token, "sr=h&ttl=60");
    }
}

//! Invoke a direct method on a device.
//!
//! ```sh
//! IOTHUB_SERVICE_CONNECTION_STRING='HostName=...;SharedAccessKeyName=...;SharedAccessKey=...' \
//!     cargo run -p iothub-service --example call -- <DEVICE_ID> <METHOD> <JSON_PAYLOAD>
//! ```
//!
//! The payload must be a non-empty JSON object, e.g. `'{"delay":5}'`. The
//! device's response payload is printed to stdout.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use iothub_service::{
    BoxError, CONNECTION_STRING_ENV, CallOptions, Credentials, RestClient, TokenSource,
};

type HmacSha256 = Hmac<Sha256>;

/// Shared access signatures signed with the policy key.
struct SasTokens {
    key_name: String,
    key: Vec<u8>,
}

impl SasTokens {
    fn new(creds: &Credentials) -> Result<Self, BoxError> {
        Ok(Self {
            key_name: creds.shared_access_key_name.clone(),
            key: BASE64.decode(&creds.shared_access_key)?,
        })
    }
}

fn url_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

impl TokenSource for SasTokens {
    fn sign(&self, resource: &str, ttl: Duration) -> Result<String, BoxError> {
        let expiry = (SystemTime::now().duration_since(UNIX_EPOCH)? + ttl).as_secs();
        let resource = url_encode(resource);

        let mut mac = HmacSha256::new_from_slice(&self.key)?;
        mac.update(format!("{resource}\n{expiry}").as_bytes());
        let sig = url_encode(&BASE64.encode(mac.finalize().into_bytes()));

        Ok(format!(
            "SharedAccessSignature sr={resource}&sig={sig}&se={expiry}&skn={}",
            self.key_name
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let usage = "usage: call <DEVICE_ID> <METHOD> <JSON_PAYLOAD>";
    let device_id = args.first().ok_or(usage)?;
    let method = args.get(1).ok_or(usage)?;
    let payload: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(args.get(2).ok_or(usage)?)?;

    let cs = std::env::var(CONNECTION_STRING_ENV)
        .map_err(|_| format!("{CONNECTION_STRING_ENV} is not set"))?;
    let creds = Credentials::from_connection_string(&cs)?;
    let tokens = Arc::new(SasTokens::new(&creds)?);
    let config = iothub_service::ClientConfig::new(creds, tokens);

    let rest = RestClient::new(&config)?;
    let opts = CallOptions {
        connect_timeout: Some(Duration::from_secs(10)),
        response_timeout: Some(Duration::from_secs(30)),
    };
    let resp = rest.call(device_id, method, &payload, &opts).await?;

    eprintln!("status: {}", resp.status);
    println!("{}", serde_json::to_string_pretty(&resp.payload)?);
    Ok(())
}

//! AWS Signature Version 4 request signing.
//!
//! [`SigV4Signer`] adds `X-Amz-Date`, `X-Amz-Security-Token` (for temporary
//! credentials) and `Authorization` to a fully built request. The body is
//! hashed as-is, so signing has to happen after compression.

use crate::error::SigningError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::Request;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const X_AMZ_DATE: &str = "x-amz-date";
const X_AMZ_SECURITY_TOKEN: &str = "x-amz-security-token";

/// Headers that proxies and clients are known to rewrite.
const UNSIGNED_HEADERS: [&str; 4] = ["authorization", "user-agent", "expect", "x-amzn-trace-id"];

/// Characters SigV4 leaves unencoded: `A-Z a-z 0-9 - _ . ~`.
const URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');
const PATH_ENCODE: &AsciiSet = &URI_ENCODE.remove(b'/');

/// Environment variable holding the access key id.
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// Environment variable holding the secret access key.
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Environment variable holding the session token of temporary credentials.
pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// Adds authentication to an outgoing request.
///
/// Implementations mutate the request in place. A returned error is terminal
/// for the export call; it is not retried.
pub trait RequestSigner: Debug + Send + Sync {
    /// Signs `request`, whose body is final.
    fn sign(&self, request: &mut Request<Bytes>) -> Result<(), SigningError>;
}

/// AWS access key pair, optionally with a session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    /// Long-lived credentials.
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Credentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Marks these as temporary credentials.
    pub fn with_session_token(mut self, session_token: impl Into<String>) -> Self {
        self.session_token = Some(session_token.into());
        self
    }

    /// Reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
    /// `AWS_SESSION_TOKEN`. Returns `None` unless both keys are set.
    pub fn from_env() -> Option<Self> {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let credentials = Credentials::new(
            non_empty(AWS_ACCESS_KEY_ID)?,
            non_empty(AWS_SECRET_ACCESS_KEY)?,
        );
        Some(match non_empty(AWS_SESSION_TOKEN) {
            Some(token) => credentials.with_session_token(token),
            None => credentials,
        })
    }

    /// The access key id.
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Signs requests with AWS Signature Version 4.
///
/// Without explicit credentials the signer reads them from the environment on
/// every request, so rotated keys are picked up without rebuilding the
/// exporter.
#[derive(Clone, Debug)]
pub struct SigV4Signer {
    region: String,
    service: String,
    credentials: Option<Credentials>,
}

impl SigV4Signer {
    /// Creates a signer for `service` in `region`.
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        SigV4Signer {
            region: region.into(),
            service: service.into(),
            credentials: None,
        }
    }

    /// Uses fixed credentials instead of the environment.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Signing region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Signing service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Signs `request` as if it were sent at `now`.
    pub fn sign_at(
        &self,
        request: &mut Request<Bytes>,
        now: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        let credentials = self
            .credentials
            .clone()
            .or_else(Credentials::from_env)
            .ok_or(SigningError::MissingCredentials)?;

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let headers = request.headers_mut();
        headers.remove(AUTHORIZATION);
        headers.remove(X_AMZ_SECURITY_TOKEN);
        headers.insert(HeaderName::from_static(X_AMZ_DATE), header_value(&amz_date)?);
        if let Some(token) = &credentials.session_token {
            headers.insert(
                HeaderName::from_static(X_AMZ_SECURITY_TOKEN),
                header_value(token)?,
            );
        }

        let (canonical_request, signed_headers) = canonical_request(request)?;
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = [
            self.region.as_bytes(),
            self.service.as_bytes(),
            b"aws4_request",
        ]
        .iter()
        .try_fold(
            hmac_sha256(
                format!("AWS4{}", credentials.secret_access_key).as_bytes(),
                date.as_bytes(),
            )?,
            |key, part| hmac_sha256(&key, part),
        )?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, header_value(&authorization)?);
        Ok(())
    }
}

impl RequestSigner for SigV4Signer {
    fn sign(&self, request: &mut Request<Bytes>) -> Result<(), SigningError> {
        self.sign_at(request, Utc::now())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SigningError> {
    HeaderValue::from_str(value)
        .map_err(|e| SigningError::InvalidRequest(format!("invalid header value: {e}")))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SigningError::InvalidRequest(format!("invalid signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Builds the canonical request and the `SignedHeaders` list.
fn canonical_request(request: &Request<Bytes>) -> Result<(String, String), SigningError> {
    let uri = request.uri();
    let authority = uri
        .authority()
        .ok_or_else(|| SigningError::InvalidRequest("request URI has no host".into()))?;

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in request.headers() {
        let name = name.as_str();
        if UNSIGNED_HEADERS.contains(&name) {
            continue;
        }
        let value = value.to_str().map_err(|_| {
            SigningError::InvalidRequest(format!("header {name} is not visible ASCII"))
        })?;
        headers
            .entry(name.to_owned())
            .or_default()
            .push(normalize_header_value(value));
    }
    headers
        .entry("host".to_owned())
        .or_insert_with(|| vec![host_header(uri.scheme_str(), authority)]);

    let canonical_headers: String = headers
        .iter()
        .map(|(name, values)| format!("{name}:{}\n", values.join(",")))
        .collect();
    let signed_headers = headers
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method().as_str(),
        canonical_uri(uri.path()),
        canonical_query(uri.query().unwrap_or("")),
        canonical_headers,
        signed_headers,
        hex::encode(Sha256::digest(request.body()))
    );
    Ok((canonical, signed_headers))
}

/// Host as the HTTP client will send it: the port only when it is not the
/// scheme default.
fn host_header(scheme: Option<&str>, authority: &http::uri::Authority) -> String {
    let default_port = match scheme {
        Some("https") => Some(443),
        Some("http") => Some(80),
        _ => None,
    };
    match authority.port_u16() {
        Some(port) if Some(port) != default_port => format!("{}:{port}", authority.host()),
        _ => authority.host().to_owned(),
    }
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_owned();
    }
    utf8_percent_encode(path, PATH_ENCODE).to_string()
}

fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (encode_query_component(key), encode_query_component(value))
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode_query_component(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    utf8_percent_encode(&decoded, URI_ENCODE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn example_credentials() -> Credentials {
        Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY")
    }

    fn signing_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    fn header<'a>(request: &'a Request<Bytes>, name: &str) -> Option<&'a str> {
        request.headers().get(name).map(|v| v.to_str().unwrap())
    }

    #[test]
    fn test_get_vanilla_vector() {
        let signer = SigV4Signer::new("us-east-1", "service").with_credentials(example_credentials());
        let mut request = Request::get("https://example.amazonaws.com/")
            .body(Bytes::new())
            .unwrap();

        signer.sign_at(&mut request, signing_time()).unwrap();

        assert_eq!(signer.region(), "us-east-1");
        assert_eq!(signer.service(), "service");
        assert_eq!(header(&request, "x-amz-date"), Some("20150830T123600Z"));
        assert_eq!(
            header(&request, "authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
                 SignedHeaders=host;x-amz-date, \
                 Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
            )
        );
    }

    #[test]
    fn test_session_token_is_added_and_signed() {
        let signer = SigV4Signer::new("us-west-2", "xray")
            .with_credentials(example_credentials().with_session_token("token-123"));
        let mut request = Request::post("https://xray.us-west-2.amazonaws.com/v1/traces")
            .header("content-type", "application/x-protobuf")
            .body(Bytes::from_static(b"payload"))
            .unwrap();

        signer.sign_at(&mut request, signing_time()).unwrap();

        assert_eq!(header(&request, "x-amz-security-token"), Some("token-123"));
        let authorization = header(&request, "authorization").unwrap();
        assert!(authorization.contains("/20150830/us-west-2/xray/aws4_request"));
        assert!(authorization
            .contains("SignedHeaders=content-type;host;x-amz-date;x-amz-security-token,"));
    }

    #[test]
    fn test_user_agent_is_not_signed() {
        let signer = SigV4Signer::new("us-east-1", "xray").with_credentials(example_credentials());
        let mut request = Request::post("https://xray.us-east-1.amazonaws.com/v1/traces")
            .header("user-agent", "test-agent")
            .body(Bytes::new())
            .unwrap();

        signer.sign_at(&mut request, signing_time()).unwrap();

        let authorization = header(&request, "authorization").unwrap();
        assert!(authorization.contains("SignedHeaders=host;x-amz-date,"));
    }

    #[test]
    fn test_signature_depends_on_body() {
        let signer = SigV4Signer::new("us-east-1", "xray").with_credentials(example_credentials());
        let sign = |body: &'static [u8]| {
            let mut request = Request::post("https://xray.us-east-1.amazonaws.com/v1/traces")
                .body(Bytes::from_static(body))
                .unwrap();
            signer.sign_at(&mut request, signing_time()).unwrap();
            header(&request, "authorization").unwrap().to_owned()
        };

        assert_ne!(sign(b"one"), sign(b"two"));
        assert_eq!(sign(b"one"), sign(b"one"));
    }

    #[test]
    fn test_resigning_replaces_previous_signature() {
        let signer = SigV4Signer::new("us-east-1", "service").with_credentials(example_credentials());
        let mut request = Request::get("https://example.amazonaws.com/")
            .body(Bytes::new())
            .unwrap();

        signer.sign_at(&mut request, signing_time()).unwrap();
        signer.sign_at(&mut request, signing_time()).unwrap();

        assert_eq!(request.headers().get_all("authorization").iter().count(), 1);
        assert!(header(&request, "authorization")
            .unwrap()
            .ends_with("5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"));
    }

    #[test]
    fn test_missing_credentials() {
        temp_env::with_vars_unset(
            [AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN],
            || {
                let signer = SigV4Signer::new("us-east-1", "xray");
                let mut request = Request::get("https://example.amazonaws.com/")
                    .body(Bytes::new())
                    .unwrap();

                assert!(matches!(
                    signer.sign(&mut request),
                    Err(SigningError::MissingCredentials)
                ));
            },
        );
    }

    #[test]
    fn test_credentials_from_env() {
        temp_env::with_vars(
            [
                (AWS_ACCESS_KEY_ID, Some("AKID")),
                (AWS_SECRET_ACCESS_KEY, Some("secret")),
                (AWS_SESSION_TOKEN, Some("token")),
            ],
            || {
                let credentials = Credentials::from_env();
                assert_eq!(
                    credentials.as_ref().map(Credentials::access_key_id),
                    Some("AKID")
                );
                assert_eq!(
                    credentials,
                    Some(Credentials::new("AKID", "secret").with_session_token("token"))
                );
            },
        );
        temp_env::with_vars(
            [
                (AWS_ACCESS_KEY_ID, Some("AKID")),
                (AWS_SECRET_ACCESS_KEY, None),
                (AWS_SESSION_TOKEN, None),
            ],
            || assert_eq!(Credentials::from_env(), None),
        );
    }

    #[test]
    fn test_relative_uri_is_rejected() {
        let signer = SigV4Signer::new("us-east-1", "xray").with_credentials(example_credentials());
        let mut request = Request::get("/v1/traces").body(Bytes::new()).unwrap();

        assert!(matches!(
            signer.sign(&mut request),
            Err(SigningError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", example_credentials().with_session_token("token-123"));

        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(!debug.contains("EXAMPLEKEY"));
        assert!(!debug.contains("token-123"));
    }

    #[test]
    fn test_canonical_query_is_sorted_and_encoded() {
        assert_eq!(canonical_query(""), "");
        assert_eq!(canonical_query("b=2&a=1&a=0"), "a=0&a=1&b=2");
        assert_eq!(canonical_query("k=a%20b&flag"), "flag=&k=a%20b");
        assert_eq!(canonical_query("k=a/b"), "k=a%2Fb");
    }

    #[test]
    fn test_host_header_keeps_non_default_port() {
        let authority: http::uri::Authority = "localhost:4318".parse().unwrap();
        assert_eq!(host_header(Some("http"), &authority), "localhost:4318");

        let authority: http::uri::Authority = "example.com:443".parse().unwrap();
        assert_eq!(host_header(Some("https"), &authority), "example.com");
    }
}

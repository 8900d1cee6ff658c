use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::{GenerationError, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        Self {
            amz_date: datetime.format("%Y%m%dT%H%M%SZ").to_string(),
            date: datetime.format("%Y%m%d").to_string(),
        }
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self> {
        let amz_date = amz_date.trim();
        if amz_date.len() != 16 || !amz_date.is_char_boundary(8) {
            return Err(signing_error(format!(
                "amz date must look like 20150830T123600Z (got {amz_date:?})"
            )));
        }
        Ok(Self {
            amz_date: amz_date.to_string(),
            date: amz_date[..8].to_string(),
        })
    }
}

/// Signs requests with static AWS credentials for a single region and service.
#[derive(Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self> {
        let signer = Self {
            access_key: access_key.into().trim().to_string(),
            secret_key: secret_key.into().trim().to_string(),
            session_token: session_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            region: region.into().trim().to_string(),
            service: service.into().trim().to_string(),
        };
        for (label, value) in [
            ("access key", &signer.access_key),
            ("secret key", &signer.secret_key),
            ("region", &signer.region),
            ("service", &signer.service),
        ] {
            if value.is_empty() {
                return Err(signing_error(format!("{label} is required")));
            }
        }
        Ok(signer)
    }

    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SignedRequest> {
        let url = Url::parse(url).map_err(|err| signing_error(format!("invalid url {url:?}: {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| signing_error("url has no host"))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let payload_hash = sha256_hex(payload);
        let signed_map = prepare_headers(
            headers,
            &host,
            &timestamp.amz_date,
            &payload_hash,
            self.session_token.as_deref(),
        );
        let (canonical_headers, signed_headers) = canonical_headers(&signed_map);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.trim().to_ascii_uppercase(),
            canonical_uri(&url),
            canonical_query(&url),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            timestamp.amz_date,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = self.signature(&timestamp.date, &string_to_sign)?;
        let authorization = format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );

        Ok(SignedRequest {
            authorization,
            amz_date: timestamp.amz_date,
            content_sha256: payload_hash,
            security_token: self.session_token.clone(),
            canonical_request,
        })
    }

    fn signature(&self, date: &str, string_to_sign: &str) -> Result<String> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date)?;
        let k_region = hmac_sha256(&k_date, &self.region)?;
        let k_service = hmac_sha256(&k_region, &self.service)?;
        let k_signing = hmac_sha256(&k_service, "aws4_request")?;
        Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign)?))
    }
}

impl fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .field("service", &self.service)
            .field("session_token", &self.session_token.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub security_token: Option<String>,
    pub canonical_request: String,
}

impl SignedRequest {
    pub fn apply(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        let req = req
            .header("authorization", &self.authorization)
            .header("x-amz-date", &self.amz_date)
            .header("x-amz-content-sha256", &self.content_sha256);
        match &self.security_token {
            Some(token) => req.header("x-amz-security-token", token),
            None => req,
        }
    }
}

fn prepare_headers(
    headers: &BTreeMap<String, String>,
    host: &str,
    amz_date: &str,
    payload_hash: &str,
    session_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = normalize_header_value(value);
        out.entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert_with(|| value.clone());
    }
    out.entry("host".to_string())
        .or_insert_with(|| host.to_string());
    out.insert("x-amz-date".to_string(), amz_date.to_string());
    out.entry("x-amz-content-sha256".to_string())
        .or_insert_with(|| payload_hash.to_string());
    if let Some(token) = session_token {
        out.insert("x-amz-security-token".to_string(), normalize_header_value(token));
    }
    out
}

fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let canonical = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect::<String>();
    let signed = headers
        .keys()
        .map(String::as_str)
        .collect::<Vec<&str>>()
        .join(";");
    (canonical, signed)
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        aws_percent_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs = url
        .query_pairs()
        .map(|(name, value)| (aws_percent_encode(&name, true), aws_percent_encode(&value, true)))
        .collect::<Vec<(String, String)>>();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<String>>()
        .join("&")
}

/// RFC 3986 encoding with upper-case hex, as SigV4 expects.
pub fn aws_percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        let unreserved =
            matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~');
        if unreserved || (!encode_slash && byte == b'/') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| signing_error(format!("invalid hmac key: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn signing_error(message: impl Into<String>) -> GenerationError {
    GenerationError::auth("sigv4", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_canonical_request_from_aws_test_suite() -> Result<()> {
        let signer = SigV4Signer::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            None,
            "us-east-1",
            "iam",
        )?;
        let headers = BTreeMap::from([(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )]);

        let signed = signer.sign(
            "GET",
            "https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08",
            &headers,
            b"",
            SigV4Timestamp::from_amz_date("20150830T123600Z")?,
        )?;

        let expected_canonical = [
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            "content-type:application/x-www-form-urlencoded; charset=utf-8",
            "host:iam.amazonaws.com",
            "x-amz-content-sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "x-amz-date:20150830T123600Z",
            "",
            "content-type;host;x-amz-content-sha256;x-amz-date",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ]
        .join("\n");
        assert_eq!(signed.canonical_request, expected_canonical);
        assert_eq!(
            signed.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature=dd479fa8a80364edf2119ec24bebde66712ee9c9cb2b0d92eb3ab9ccdc0c3947"
        );
        Ok(())
    }

    #[test]
    fn model_ids_are_double_encoded_in_the_canonical_path() -> Result<()> {
        let signer = SigV4Signer::new("AKID", "secret", Some("session".to_string()), "us-east-1", "bedrock")?;
        let path = format!("/model/{}/invoke", aws_percent_encode("amazon.nova-canvas-v1:0", true));
        let signed = signer.sign(
            "post",
            &format!("https://bedrock-runtime.us-east-1.amazonaws.com{path}"),
            &BTreeMap::new(),
            b"{}",
            SigV4Timestamp::from_amz_date("20240101T000000Z")?,
        )?;
        let mut lines = signed.canonical_request.lines();
        assert_eq!(lines.next(), Some("POST"));
        assert_eq!(lines.next(), Some("/model/amazon.nova-canvas-v1%253A0/invoke"));
        assert!(signed.canonical_request.contains("x-amz-security-token:session"));
        assert_eq!(signed.security_token.as_deref(), Some("session"));
        Ok(())
    }

    #[test]
    fn timestamps_format_as_amz_dates() -> Result<()> {
        let datetime = DateTime::parse_from_rfc3339("2015-08-30T12:36:00Z")
            .map_err(|err| signing_error(err.to_string()))?
            .with_timezone(&Utc);
        assert_eq!(
            SigV4Timestamp::from_datetime(datetime),
            SigV4Timestamp::from_amz_date("20150830T123600Z")?
        );
        assert!(SigV4Timestamp::from_amz_date("2015").is_err());
        Ok(())
    }

    #[test]
    fn blank_keys_are_rejected() {
        let err = SigV4Signer::new(" ", "secret", None, "us-east-1", "bedrock").err();
        assert!(err.is_some_and(|err| err.to_string().contains("access key is required")));
    }
}

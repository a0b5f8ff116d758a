use bytes::Bytes;
use hmac::{Hmac, Mac};
use log::debug;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::runtime::Runtime;

use crate::hash;
use crate::transport::{Executor, Request, Response, TransportError};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "glacier";

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

// Signs each request with AWS Signature Version 4 and sends it with reqwest,
// blocking on a current-thread runtime. One executor serves any number of
// sessions; all of its state is read-only after construction.
pub struct SigV4Executor {
    client: reqwest::Client,
    rt: Runtime,
    endpoint: String,
    host: String,
    region: String,
    creds: Credentials,
}

impl SigV4Executor {
    pub fn new(endpoint: &str, region: &str, creds: Credentials) -> Result<Self, TransportError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let url = reqwest::Url::parse(endpoint).map_err(|e| {
            TransportError::InvalidRequest(format!("bad endpoint {}: {}", endpoint, e))
        })?;
        let mut host = url
            .host_str()
            .ok_or_else(|| {
                TransportError::InvalidRequest(format!("endpoint {} has no host", endpoint))
            })?
            .to_string();
        if let Some(port) = url.port() {
            host = format!("{}:{}", host, port);
        }

        Ok(SigV4Executor {
            client: reqwest::Client::new(),
            rt,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            host,
            region: region.to_string(),
            creds,
        })
    }

    pub fn for_region(region: &str, creds: Credentials) -> Result<Self, TransportError> {
        let endpoint = format!("https://glacier.{}.amazonaws.com", region);
        SigV4Executor::new(&endpoint, region, creds)
    }
}

impl Executor for SigV4Executor {
    fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let signed = sign(
            &request,
            &self.host,
            &self.region,
            &self.creds,
            OffsetDateTime::now_utc(),
        );
        let url = format!("{}{}", self.endpoint, request.path);

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in request.headers.iter().chain(signed.iter()) {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            headers.insert(name, value);
        }

        debug!("{} {} ({} byte body)", request.method, url, request.body.len());
        let call = self
            .client
            .request(request.method.clone(), url.as_str())
            .headers(headers)
            .body(request.body.clone())
            .send();
        let response = self.rt.block_on(call).map_err(map_reqwest_error)?;

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(n, v)| Some((n.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body: Bytes = self.rt.block_on(response.bytes()).map_err(map_reqwest_error)?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_builder() || err.is_request() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}

// The headers signing adds: x-amz-date and authorization. The signature
// covers host plus every x-amz-* header, sorted; the payload hash is the
// flat SHA-256 of the body.
fn sign(
    request: &Request,
    host: &str,
    region: &str,
    creds: &Credentials,
    now: OffsetDateTime,
) -> Vec<(String, String)> {
    let (date, stamp) = datestamp(now);

    let mut canonical: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(name, _)| name.to_ascii_lowercase().starts_with("x-amz-"))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    canonical.push(("host".to_string(), host.to_string()));
    canonical.push(("x-amz-date".to_string(), stamp.clone()));
    canonical.sort();

    let signed_names: String = canonical
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = canonical
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();

    let payload_hash = hash::to_hex(&hash::sha256(&request.body));
    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        request.method, request.path, canonical_headers, signed_names, payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        stamp,
        scope,
        hash::to_hex(&hash::sha256(canonical_request.as_bytes()))
    );

    let key = signing_key(&creds.secret_key, &date, region);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key, scope, signed_names, signature
    );

    vec![
        ("x-amz-date".to_string(), stamp),
        ("authorization".to_string(), authorization),
    ]
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // Hmac takes keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, SERVICE.as_bytes());
    hmac(&k_service, b"aws4_request")
}

// YYYYMMDD and YYYYMMDD'T'HHMMSS'Z'
fn datestamp(now: OffsetDateTime) -> (String, String) {
    let date = format!(
        "{:04}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    );
    let stamp = format!(
        "{}T{:02}{:02}{:02}Z",
        date,
        now.hour(),
        now.minute(),
        now.second()
    );
    (date, stamp)
}

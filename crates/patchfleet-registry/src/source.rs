use std::time::Duration;

use patchfleet_core::PatchError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw reference payload plus its detached signature, when published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedReference {
    pub payload: Vec<u8>,
    pub signature_hex: Option<String>,
}

/// Where a refresh pulls the build reference from.
pub trait ReferenceSource {
    fn describe(&self) -> String;

    fn fetch(&self) -> Result<FetchedReference, PatchError>;
}

/// Fetches the reference document (and optionally its `.sig`) over HTTP.
#[derive(Debug, Clone)]
pub struct HttpReferenceSource {
    url: String,
    signature_url: Option<String>,
}

impl HttpReferenceSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            signature_url: None,
        }
    }

    pub fn with_signature_url(mut self, signature_url: impl Into<String>) -> Self {
        self.signature_url = Some(signature_url.into());
        self
    }

    fn get(client: &reqwest::blocking::Client, url: &str) -> Result<Vec<u8>, PatchError> {
        let response = client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|err| PatchError::Network(format!("GET {url}: {err}")))?;
        let bytes = response
            .bytes()
            .map_err(|err| PatchError::Network(format!("reading body of {url}: {err}")))?;
        Ok(bytes.to_vec())
    }
}

impl ReferenceSource for HttpReferenceSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn fetch(&self) -> Result<FetchedReference, PatchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|err| PatchError::Network(format!("failed building HTTP client: {err}")))?;

        let payload = Self::get(&client, &self.url)?;
        let signature_hex = match &self.signature_url {
            Some(signature_url) => {
                let raw = Self::get(&client, signature_url)?;
                Some(String::from_utf8_lossy(&raw).trim().to_string())
            }
            None => None,
        };

        Ok(FetchedReference {
            payload,
            signature_hex,
        })
    }
}

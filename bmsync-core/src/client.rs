use std::path::Path;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, DATE, HeaderMap};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::multistatus::{PropResponse, parse_multistatus, sha1_from_checksums, trim_quotes};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CHECKSUM_HEADER: &str = "OC-Checksum";
const RECALCULATE_HEADER: &str = "X-Recalculate-Hash";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

const PROPFIND_ETAG: &str = r#"<?xml version="1.0" encoding="UTF-8"?><d:propfind xmlns:d="DAV:"><d:prop><d:getetag/></d:prop></d:propfind>"#;
const PROPFIND_CHECKSUMS: &str = r#"<?xml version="1.0" encoding="UTF-8"?><d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns"><d:prop><oc:checksums/></d:prop></d:propfind>"#;
const PROPFIND_LAST_MODIFIED: &str = r#"<?xml version="1.0" encoding="UTF-8"?><d:propfind xmlns:d="DAV:"><d:prop><d:getlastmodified/></d:prop></d:propfind>"#;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server url cannot be used as a base: {0}")]
    CannotBeBase(String),
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed multistatus response: {0}")]
    Xml(String),
    #[error("property {0} missing from response")]
    MissingProperty(&'static str),
    #[error("unparseable date: {0}")]
    InvalidDate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavErrorClass {
    /// Credentials were rejected; the user has to re-authorize.
    Auth,
    /// Connectivity problem or a transient server condition.
    Network,
    /// Anything a conforming server should never produce.
    Unexpected,
}

impl DavError {
    pub fn classification(&self) -> DavErrorClass {
        match self {
            DavError::Request(err) if err.is_builder() => DavErrorClass::Unexpected,
            DavError::Request(_) => DavErrorClass::Network,
            DavError::Status { status, .. } => classify_status(*status),
            _ => DavErrorClass::Unexpected,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DavError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

fn classify_status(status: StatusCode) -> DavErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        DavErrorClass::Auth
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        DavErrorClass::Network
    } else {
        DavErrorClass::Unexpected
    }
}

#[derive(Debug, Clone)]
pub struct DavOptions {
    pub timeout: Duration,
    /// Accept self-signed certificates of self-hosted servers.
    pub accept_invalid_certs: bool,
}

impl Default for DavOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

/// A file entry of a collection listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    /// Lowercase hex SHA-1 if the server knows one for this file.
    pub sha1: Option<String>,
}

/// Last-modified time of a resource together with the server clock at the
/// moment of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifiedAt {
    pub modified: SystemTime,
    pub server_now: SystemTime,
}

impl ModifiedAt {
    /// Age of the resource as seen by the server. A timestamp in the future
    /// counts as brand new.
    pub fn age(&self) -> Duration {
        self.server_now
            .duration_since(self.modified)
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    files_root: Url,
    login: String,
    app_password: String,
}

impl DavClient {
    pub fn new(server: &str, login: &str, app_password: &str) -> Result<Self, DavError> {
        Self::with_options(server, login, app_password, DavOptions::default())
    }

    pub fn with_options(
        server: &str,
        login: &str,
        app_password: &str,
        options: DavOptions,
    ) -> Result<Self, DavError> {
        let mut files_root = Url::parse(server)?;
        files_root
            .path_segments_mut()
            .map_err(|_| DavError::CannotBeBase(server.to_string()))?
            .pop_if_empty()
            .extend(["remote.php", "dav", "files", login]);
        let http = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            files_root,
            login: login.to_string(),
            app_password: app_password.to_string(),
        })
    }

    /// Resolves `segments` under the user's WebDAV files root. Segments are
    /// percent-encoded as needed.
    pub fn url_for(&self, segments: &[&str]) -> Result<Url, DavError> {
        let mut url = self.files_root.clone();
        url.path_segments_mut()
            .map_err(|_| DavError::CannotBeBase(self.files_root.to_string()))?
            .extend(segments);
        Ok(url)
    }

    pub fn files_root(&self) -> &Url {
        &self.files_root
    }

    /// ETag of a collection, or `None` if it does not exist.
    pub async fn etag(&self, url: &Url) -> Result<Option<String>, DavError> {
        let response = self
            .propfind(url, 0, PROPFIND_ETAG)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let responses = Self::multistatus(response).await?;
        responses
            .iter()
            .find_map(|r| r.etag.as_deref())
            .map(|etag| Some(trim_quotes(etag).to_string()))
            .ok_or(DavError::MissingProperty("getetag"))
    }

    /// Creates a collection. An already existing collection is not an error.
    pub async fn make_collection(&self, url: &Url) -> Result<(), DavError> {
        let response = self.request(dav_method("MKCOL"), url).send().await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    /// Lists the direct children of a collection with their SHA-1 checksums.
    pub async fn list_checksums(&self, url: &Url) -> Result<Vec<RemoteEntry>, DavError> {
        let response = self
            .propfind(url, 1, PROPFIND_CHECKSUMS)
            .send()
            .await?;
        let responses = Self::multistatus(response).await?;
        let entries = responses
            .iter()
            .filter_map(|response| {
                let name = entry_name(&response.href)?;
                Some(RemoteEntry {
                    name,
                    sha1: sha1_from_checksums(response.checksums.iter().map(String::as_str)),
                })
            })
            .collect::<Vec<_>>();
        tracing::debug!(collection = %url, count = entries.len(), "listed remote entries");
        Ok(entries)
    }

    /// Asks the server to compute and store the SHA-1 of a file. Returns
    /// `None` when the server does not support the request.
    pub async fn recalculate_sha1(&self, url: &Url) -> Result<Option<String>, DavError> {
        let response = self
            .request(Method::PATCH, url)
            .header(RECALCULATE_HEADER, "sha1")
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(DavError::Status { status, body });
        }
        Ok(checksum_header(response.headers()))
    }

    /// Streams a file into `destination`, replacing it. Returns the number of
    /// bytes written.
    pub async fn download_to(&self, url: &Url, destination: &Path) -> Result<u64, DavError> {
        let response = self.request(Method::GET, url).send().await?;
        let response = Self::check(response).await?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Uploads `bytes`, tagging the file with its SHA-1 when one is given.
    pub async fn put_bytes(
        &self,
        url: &Url,
        bytes: Vec<u8>,
        content_type: &str,
        sha1: Option<&str>,
    ) -> Result<(), DavError> {
        let size = bytes.len();
        let mut request = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(sha1) = sha1 {
            request = request.header(CHECKSUM_HEADER, format!("SHA1:{sha1}"));
        }
        let response = request.send().await?;
        Self::check(response).await?;
        tracing::debug!(target_url = %url, size, "uploaded");
        Ok(())
    }

    /// Deletes a resource. Returns `false` if it did not exist.
    pub async fn delete(&self, url: &Url) -> Result<bool, DavError> {
        let response = self.request(Method::DELETE, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    /// Last-modified time of a resource, or `None` if it does not exist.
    pub async fn last_modified(&self, url: &Url) -> Result<Option<ModifiedAt>, DavError> {
        let response = self
            .propfind(url, 0, PROPFIND_LAST_MODIFIED)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let server_now = response
            .headers()
            .get(DATE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
            .unwrap_or_else(SystemTime::now);
        let responses = Self::multistatus(response).await?;
        let raw = responses
            .iter()
            .find_map(|r| r.last_modified.as_deref())
            .ok_or(DavError::MissingProperty("getlastmodified"))?;
        let modified = httpdate::parse_http_date(raw)
            .map_err(|_| DavError::InvalidDate(raw.to_string()))?;
        Ok(Some(ModifiedAt {
            modified,
            server_now,
        }))
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        self.http
            .request(method, url.clone())
            .basic_auth(&self.login, Some(&self.app_password))
    }

    fn propfind(&self, url: &Url, depth: u8, body: &'static str) -> RequestBuilder {
        self.request(dav_method("PROPFIND"), url)
            .header("Depth", depth.to_string())
            .header(CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(body)
    }

    async fn check(response: Response) -> Result<Response, DavError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Status { status, body })
        }
    }

    async fn multistatus(response: Response) -> Result<Vec<PropResponse>, DavError> {
        let response = Self::check(response).await?;
        let body = response.text().await?;
        parse_multistatus(&body)
    }
}

fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("WebDAV method names are valid tokens")
}

fn checksum_header(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CHECKSUM_HEADER)?.to_str().ok()?;
    sha1_from_checksums([value])
}

/// Decoded last path segment of a file href; `None` for collections.
fn entry_name(href: &str) -> Option<String> {
    if href.is_empty() || href.ends_with('/') {
        return None;
    }
    let last = href.rsplit('/').next()?;
    let decoded = urlencoding::decode(last).ok()?.into_owned();
    // Encoded separators would let a listing entry escape the collection.
    if decoded.is_empty()
        || decoded == "."
        || decoded.contains("..")
        || decoded.contains(['/', '\\'])
    {
        return None;
    }
    Some(decoded)
}

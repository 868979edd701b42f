use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::config::WebDAVConfig;

/// Minimal WebDAV client for the sync document and its backups
pub struct WebDAVClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

#[derive(Error, Debug)]
pub enum WebDAVError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid method: {0}")]
    InvalidMethod(String),
}

/// Response from a PUT operation
#[derive(Debug)]
pub struct PutResponse {
    pub etag: Option<String>,
    /// The If-Match precondition failed
    pub conflict: bool,
}

/// File/directory info from PROPFIND
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceInfo {
    pub path: String,
    pub is_collection: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
}

impl WebDAVClient {
    pub fn new(config: &WebDAVConfig) -> Result<Self, WebDAVError> {
        let base_url = config.server_url.trim().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(WebDAVError::InvalidUrl(
                "URL must start with http:// or https://".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Test connection to the WebDAV server
    pub async fn test_connection(&self) -> Result<bool, WebDAVError> {
        let resources = self.propfind("", 0).await?;
        Ok(!resources.is_empty())
    }

    /// PROPFIND - list a collection or read resource properties
    pub async fn propfind(&self, path: &str, depth: u32) -> Result<Vec<ResourceInfo>, WebDAVError> {
        let response = self
            .request(dav_method(b"PROPFIND")?, path)
            .header("Depth", depth.to_string())
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        let response = check_status(response, path).await?;
        let xml = response.text().await?;
        Ok(parse_propfind_response(&xml, &self.base_url))
    }

    /// GET - file contents and ETag, `None` when the file does not exist
    pub async fn get(&self, path: &str) -> Result<Option<(Vec<u8>, Option<String>)>, WebDAVError> {
        let response = self.request(Method::GET, path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check_status(response, path).await?;
        let etag = etag_header(&response);
        let data = response.bytes().await?.to_vec();
        Ok(Some((data, etag)))
    }

    /// PUT - upload with optional If-Match for optimistic locking
    pub async fn put(&self, path: &str, data: Vec<u8>, etag: Option<&str>) -> Result<PutResponse, WebDAVError> {
        let mut request = self
            .request(Method::PUT, path)
            .header("Content-Type", "application/json")
            .body(data);
        if let Some(tag) = etag.and_then(if_match_value) {
            request = request.header("If-Match", tag);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Ok(PutResponse {
                etag: None,
                conflict: true,
            });
        }

        let response = check_status(response, path).await?;
        Ok(PutResponse {
            etag: etag_header(&response),
            conflict: false,
        })
    }

    /// MKCOL - create a collection. An existing one is not an error.
    pub async fn mkcol(&self, path: &str) -> Result<(), WebDAVError> {
        let response = self.request(dav_method(b"MKCOL")?, path).send().await?;
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        check_status(response, path).await?;
        Ok(())
    }

    /// Create every collection along `path`
    pub async fn mkdir_p(&self, path: &str) -> Result<(), WebDAVError> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);

            match self.mkcol(&current).await {
                Ok(()) => {}
                Err(WebDAVError::AuthFailed) => return Err(WebDAVError::AuthFailed),
                // Some servers answer 409 for an existing parent
                Err(e) => log::debug!("WebDAV: MKCOL {} ignored: {}", current, e),
            }
        }
        Ok(())
    }
}

fn dav_method(name: &'static [u8]) -> Result<Method, WebDAVError> {
    Method::from_bytes(name)
        .map_err(|_| WebDAVError::InvalidMethod(String::from_utf8_lossy(name).into_owned()))
}

fn etag_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

/// If-Match value for an entity tag. Weak tags never match under the strong
/// comparison If-Match uses, so none is sent for them.
fn if_match_value(etag: &str) -> Option<String> {
    if etag.starts_with("W/") {
        return None;
    }
    Some(format!("\"{}\"", etag.trim_matches('"')))
}

/// Map auth, missing and server failures onto [`WebDAVError`]
async fn check_status(response: Response, path: &str) -> Result<Response, WebDAVError> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WebDAVError::AuthFailed),
        StatusCode::NOT_FOUND => Err(WebDAVError::NotFound(path.to_string())),
        status if status.is_success() || status == StatusCode::MULTI_STATUS => Ok(response),
        status => Err(WebDAVError::Server {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        }),
    }
}

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:getlastmodified/>
    <D:getetag/>
    <D:getcontentlength/>
    <D:resourcetype/>
  </D:prop>
</D:propfind>"#;

/// Text between `<D:tag>` and `</D:tag>` (either prefix case) on one line
fn tag_text<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    ["D:", "d:"].iter().find_map(|prefix| {
        let open = format!("<{}{}>", prefix, tag);
        let close = format!("</{}{}>", prefix, tag);
        let start = line.find(&open)? + open.len();
        let end = line[start..].find(&close)? + start;
        Some(&line[start..end])
    })
}

/// Path of an href relative to the client's base URL
fn relative_href(href: &str, base_url: &str) -> String {
    let path = if let Some(stripped) = href.strip_prefix(base_url) {
        stripped
    } else {
        // Most servers return absolute paths rather than full URLs
        let base_path = base_url
            .find("://")
            .map(|i| &base_url[i + 3..])
            .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or("")
            .trim_end_matches('/');
        href.strip_prefix(base_path).unwrap_or(href)
    };
    let path = path.trim_matches('/');
    urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Parse a PROPFIND multistatus body. Expects one element per line, which
/// is what common servers emit.
fn parse_propfind_response(xml: &str, base_url: &str) -> Vec<ResourceInfo> {
    let mut resources = Vec::new();
    let mut current: Option<ResourceInfo> = None;

    for line in xml.lines().map(str::trim) {
        if line.contains("<D:response>") || line.contains("<d:response>") {
            current = Some(ResourceInfo {
                path: String::new(),
                is_collection: false,
                etag: None,
                last_modified: None,
                content_length: None,
            });
        }

        if let Some(resource) = current.as_mut() {
            if let Some(href) = tag_text(line, "href") {
                resource.path = relative_href(href, base_url);
            }
            if let Some(etag) = tag_text(line, "getetag") {
                resource.etag = Some(etag.trim_matches('"').to_string());
            }
            if let Some(length) = tag_text(line, "getcontentlength") {
                resource.content_length = length.parse().ok();
            }
            if let Some(modified) = tag_text(line, "getlastmodified") {
                resource.last_modified = Some(modified.to_string());
            }
            if line.contains("<D:collection") || line.contains("<d:collection") {
                resource.is_collection = true;
            }
        }

        if line.contains("</D:response>") || line.contains("</d:response>") {
            if let Some(resource) = current.take() {
                resources.push(resource);
            }
        }
    }

    log::debug!("WebDAV: parsed {} PROPFIND entries", resources.len());
    resources
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
<d:response>
<d:href>/remote.php/dav/files/me/</d:href>
<d:propstat>
<d:prop>
<d:resourcetype><d:collection/></d:resourcetype>
<d:getlastmodified>Tue, 01 Oct 2024 10:00:00 GMT</d:getlastmodified>
</d:prop>
</d:propstat>
</d:response>
<d:response>
<d:href>/remote.php/dav/files/me/tabdeck/tabdeck%20data.json</d:href>
<d:propstat>
<d:prop>
<d:getetag>"abc123"</d:getetag>
<d:getcontentlength>512</d:getcontentlength>
<d:resourcetype/>
</d:prop>
</d:propstat>
</d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_propfind_relative_paths() {
        let resources =
            parse_propfind_response(MULTISTATUS, "https://cloud.example.com/remote.php/dav/files/me");
        assert_eq!(resources.len(), 2);

        assert_eq!(resources[0].path, "");
        assert!(resources[0].is_collection);
        assert!(resources[0].last_modified.is_some());

        assert_eq!(resources[1].path, "tabdeck/tabdeck data.json");
        assert!(!resources[1].is_collection);
        assert_eq!(resources[1].etag.as_deref(), Some("abc123"));
        assert_eq!(resources[1].content_length, Some(512));
    }

    #[test]
    fn test_relative_href_accepts_full_urls() {
        assert_eq!(
            relative_href("https://dav.example.com/base/a/b.json", "https://dav.example.com/base"),
            "a/b.json"
        );
    }

    #[test]
    fn test_client_rejects_non_http_url() {
        let config = WebDAVConfig {
            server_url: "dav.example.com".to_string(),
            username: "me".to_string(),
            ..Default::default()
        };
        assert!(matches!(WebDAVClient::new(&config), Err(WebDAVError::InvalidUrl(_))));
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let config = WebDAVConfig {
            server_url: "https://dav.example.com/files/".to_string(),
            username: "me".to_string(),
            ..Default::default()
        };
        let client = WebDAVClient::new(&config).unwrap();
        assert_eq!(client.url("/tabdeck/x.json"), "https://dav.example.com/files/tabdeck/x.json");
        assert_eq!(client.url(""), "https://dav.example.com/files");
    }

    #[test]
    fn test_if_match_skips_weak_tags() {
        assert_eq!(if_match_value("\"abc123\"").as_deref(), Some("\"abc123\""));
        assert_eq!(if_match_value("abc123").as_deref(), Some("\"abc123\""));
        assert_eq!(if_match_value("W/\"abc123\""), None);
    }
}

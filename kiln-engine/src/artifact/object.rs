// S3-compatible object-store backend
// Path-style HTTP against a generic gateway with static bearer credentials.
// List parsing handles the ListObjectsV2 XML shape by scanning <Key> tags.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

use crate::artifact::backend::{BlobBackend, BlobMeta, ByteRange};
use crate::config::ObjectStoreStorage;
use crate::error::StorageError;

pub struct ObjectStoreBackend {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    access_token: String,
}

impl ObjectStoreBackend {
    pub fn new(config: &ObjectStoreStorage) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            access_token: config.access_token.clone(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.access_token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.access_token)
        }
    }
}

fn classify(err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() {
        StorageError::Transient(err.to_string())
    } else {
        StorageError::Permanent(err.to_string())
    }
}

fn classify_status(status: StatusCode, key: &str) -> StorageError {
    if status == StatusCode::NOT_FOUND {
        StorageError::NotFound(key.to_string())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StorageError::Transient(format!("gateway returned {status} for '{key}'"))
    } else {
        StorageError::Permanent(format!("gateway returned {status} for '{key}'"))
    }
}

#[async_trait]
impl BlobBackend for ObjectStoreBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<u64, StorageError> {
        let size = data.len() as u64;
        let response = self
            .authorize(self.client.put(self.object_url(key)))
            .body(data)
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), key));
        }
        Ok(size)
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes, StorageError> {
        let mut request = self.authorize(self.client.get(self.object_url(key)));
        if let Some(range) = range {
            let header = match range.len {
                Some(len) if len > 0 => {
                    format!("bytes={}-{}", range.start, range.start + len - 1)
                }
                _ => format!("bytes={}-", range.start),
            };
            request = request.header(reqwest::header::RANGE, header);
        }

        let response = request.send().await.map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), key));
        }
        response.bytes().await.map_err(classify)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self
            .authorize(self.client.delete(self.object_url(key)))
            .send()
            .await
            .map_err(classify)?;
        // Missing objects delete cleanly.
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(classify_status(response.status(), key));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let url = format!(
            "{}/{}?list-type=2&prefix={}",
            self.endpoint, self.bucket, prefix
        );
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), prefix));
        }
        let body = response.text().await.map_err(classify)?;
        Ok(parse_keys(&body))
    }

    async fn head(&self, key: &str) -> Result<BlobMeta, StorageError> {
        let response = self
            .authorize(self.client.head(self.object_url(key)))
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), key));
        }
        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(BlobMeta { size })
    }
}

/// Pull `<Key>...</Key>` values out of a ListObjectsV2 response.
fn parse_keys(xml: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Key>") {
        let after = &rest[start + 5..];
        let Some(end) = after.find("</Key>") else {
            break;
        };
        keys.push(after[..end].to_string());
        rest = &after[end + 6..];
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_keys() {
        let xml = r#"<?xml version="1.0"?>
<ListBucketResult>
  <Name>kiln-artifacts</Name>
  <Contents><Key>run1/a</Key><Size>5</Size></Contents>
  <Contents><Key>run1/b</Key><Size>9</Size></Contents>
</ListBucketResult>"#;
        assert_eq!(parse_keys(xml), vec!["run1/a", "run1/b"]);
        assert!(parse_keys("<Empty/>").is_empty());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "k"),
            StorageError::NotFound(_)
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "k").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "k").is_transient());
        assert!(!classify_status(StatusCode::FORBIDDEN, "k").is_transient());
    }

    #[test]
    fn test_object_url_shape() {
        let backend = ObjectStoreBackend::new(&ObjectStoreStorage {
            endpoint: "https://blobs.internal:9000/".to_string(),
            bucket: "kiln".to_string(),
            access_token: String::new(),
        });
        assert_eq!(
            backend.object_url("run1/bundle"),
            "https://blobs.internal:9000/kiln/run1/bundle"
        );
    }
}

//! Object storage client (Google Drive)
//!
//! Uploads go into a named folder under the configured root folder using a
//! chunked resumable session, then the file is shared publicly by link.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use super::{check_status, ObjectStorage, ServiceError};
use crate::config::GoogleDriveConfig;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Resumable upload chunk size; must be a multiple of 256 KiB
const CHUNK_SIZE: usize = 1024 * 1024;

/// Refresh this long before the access token actually expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Serialize)]
struct FileMetadata<'a> {
    name: &'a str,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    parents: Vec<&'a str>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Public download link for a Drive file id
pub fn public_download_link(file_id: &str) -> String {
    format!("https://drive.google.com/uc?id={}&export=download", file_id)
}

/// Drive query selecting a non-trashed folder by name
fn folder_query(folder_name: &str, parent_id: Option<&str>) -> String {
    let escaped = folder_name.replace('\\', "\\\\").replace('\'', "\\'");
    let mut query = format!(
        "mimeType = '{}' and name = '{}' and trashed = false",
        FOLDER_MIME, escaped
    );
    if let Some(parent) = parent_id {
        query.push_str(&format!(" and '{}' in parents", parent));
    }
    query
}

pub struct GoogleDriveClient {
    http_client: reqwest::Client,
    config: GoogleDriveConfig,
    token: Mutex<Option<CachedToken>>,
    folder_id: Mutex<Option<String>>,
}

impl GoogleDriveClient {
    pub fn new(config: GoogleDriveConfig) -> Result<Self, ServiceError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            config,
            token: Mutex::new(None),
            folder_id: Mutex::new(None),
        })
    }

    /// Current access token, refreshed from the refresh token when stale
    async fn access_token(&self) -> Result<String, ServiceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let refresh_token = self
            .config
            .refresh_token
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("GOOGLE_DRIVE_REFRESH_TOKEN".to_string()))?;
        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("GOOGLE_DRIVE_CLIENT_ID".to_string()))?;
        let client_secret = self
            .config
            .client_secret
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("GOOGLE_DRIVE_CLIENT_SECRET".to_string()))?;

        let response = self
            .http_client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let token: TokenResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Decode(format!("token refresh: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let expires_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
        tracing::debug!(expires_in_secs = lifetime.as_secs(), "Drive access token refreshed");

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    /// Find (or create) the upload folder under the root folder
    async fn upload_folder(&self, token: &str) -> Result<String, ServiceError> {
        let mut cached = self.folder_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let root = self.config.folder_id.as_deref();
        let query = folder_query(&self.config.folder_name, root);

        let response = self
            .http_client
            .get(FILES_URL)
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id, name)"),
                ("pageSize", "1"),
                ("spaces", "drive"),
            ])
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let list: FileList = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;

        let folder_id = match list.files.into_iter().next() {
            Some(folder) => folder.id,
            None => {
                let metadata = FileMetadata {
                    name: &self.config.folder_name,
                    mime_type: Some(FOLDER_MIME),
                    parents: root.into_iter().collect(),
                };
                let response = self
                    .http_client
                    .post(FILES_URL)
                    .bearer_auth(token)
                    .query(&[("fields", "id, name")])
                    .json(&metadata)
                    .send()
                    .await
                    .map_err(ServiceError::from_reqwest)?;
                let created: DriveFile = check_status(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ServiceError::Decode(e.to_string()))?;
                tracing::info!(
                    folder = %self.config.folder_name,
                    folder_id = %created.id,
                    "Created Drive upload folder"
                );
                created.id
            }
        };

        *cached = Some(folder_id.clone());
        Ok(folder_id)
    }

    /// Open a resumable session and stream the file in chunks
    async fn upload_resumable(
        &self,
        token: &str,
        local_path: &Path,
        name: &str,
        mime_type: &str,
        folder_id: &str,
    ) -> Result<String, ServiceError> {
        let total = tokio::fs::metadata(local_path).await?.len();

        let metadata = FileMetadata {
            name,
            mime_type: None,
            parents: vec![folder_id],
        };
        let response = self
            .http_client
            .post(UPLOAD_URL)
            .bearer_auth(token)
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", total.to_string())
            .json(&metadata)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let response = check_status(response).await?;
        let session_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Decode("resumable session has no Location".to_string()))?;

        let mut file = tokio::fs::File::open(local_path).await?;
        let mut offset: u64 = 0;
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let read = read_chunk(&mut file, &mut buffer).await?;
            let end = offset + read as u64;
            let content_range = if total == 0 {
                "bytes */0".to_string()
            } else {
                format!("bytes {}-{}/{}", offset, end.saturating_sub(1), total)
            };

            let response = self
                .http_client
                .put(&session_url)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_RANGE, content_range)
                .body(buffer[..read].to_vec())
                .send()
                .await
                .map_err(ServiceError::from_reqwest)?;

            // 308 Resume Incomplete: more chunks expected
            if response.status().as_u16() == 308 {
                offset = end;
                if read == 0 {
                    return Err(ServiceError::Decode(
                        "upload session expects more bytes than the file holds".to_string(),
                    ));
                }
                continue;
            }

            let uploaded: DriveFile = check_status(response)
                .await?
                .json()
                .await
                .map_err(|e| ServiceError::Decode(e.to_string()))?;
            return Ok(uploaded.id);
        }
    }

    async fn make_anyone_reader(&self, token: &str, file_id: &str) -> Result<(), ServiceError> {
        let response = self
            .http_client
            .post(format!("{}/{}/permissions", FILES_URL, file_id))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&json!({"type": "anyone", "role": "reader"}))
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;
        check_status(response).await?;
        Ok(())
    }
}

/// Fill `buffer` as far as the file allows, returning bytes read
async fn read_chunk(file: &mut tokio::fs::File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl ObjectStorage for GoogleDriveClient {
    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        mime_type: &str,
    ) -> Result<String, ServiceError> {
        let token = self.access_token().await?;
        let folder_id = self.upload_folder(&token).await?;
        let file_id = self
            .upload_resumable(&token, local_path, name, mime_type, &folder_id)
            .await?;
        self.make_anyone_reader(&token, &file_id).await?;

        let link = public_download_link(&file_id);
        tracing::info!(name, file_id = %file_id, "Uploaded artifact to Drive");
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_download_link() {
        assert_eq!(
            public_download_link("abc123"),
            "https://drive.google.com/uc?id=abc123&export=download"
        );
    }

    #[test]
    fn test_folder_query_escapes_and_scopes() {
        assert_eq!(
            folder_query("it's", Some("root-1")),
            "mimeType = 'application/vnd.google-apps.folder' and name = 'it\\'s' \
             and trashed = false and 'root-1' in parents"
        );
        assert!(!folder_query("test", None).contains("in parents"));
    }

    #[tokio::test]
    async fn test_upload_without_credentials_is_not_configured() {
        let client = GoogleDriveClient::new(GoogleDriveConfig {
            client_id: None,
            client_secret: None,
            refresh_token: None,
            folder_id: None,
            folder_name: "test".to_string(),
        })
        .unwrap();

        let err = client
            .upload(Path::new("/nonexistent.wav"), "x.wav", "audio/wav")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotConfigured(_)));
    }
}

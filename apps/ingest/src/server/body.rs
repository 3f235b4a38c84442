use std::io;
use std::path::Path;

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::Form;
use serde_json::Value;
use serde_json::map::Entry;
use tokio::io::AsyncWriteExt;

use crate::screenshots::TempUpload;
use crate::validation::RawFields;

const SCREENSHOT_FIELD: &str = "screenshot";

/// Callback body reduced to plain fields plus the buffered screenshot, if any.
#[derive(Debug, Default)]
pub(super) struct DecodedBody {
    pub(super) fields: RawFields,
    pub(super) screenshot: Option<TempUpload>,
}

#[derive(Debug, thiserror::Error)]
pub(super) enum BodyError {
    #[error("Unsupported content type '{0}'.")]
    UnsupportedContentType(String),
    #[error("Malformed request body: {0}")]
    Malformed(String),
    #[error("JSON request body must be an object.")]
    NotAnObject,
    #[error("Request body is too large.")]
    TooLarge,
    #[error("failed to write upload: {0}")]
    Upload(#[from] io::Error),
}

impl BodyError {
    fn from_status(status: StatusCode, message: String) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            Self::TooLarge
        } else {
            Self::Malformed(message)
        }
    }
}

/// Decodes multipart, urlencoded or JSON bodies. Without a content type the
/// body is ignored and every field takes its default.
pub(super) async fn decode_body(
    request: Request,
    upload_dir: &Path,
) -> Result<DecodedBody, BodyError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase());

    let Some(content_type) = content_type else {
        return Ok(DecodedBody::default());
    };
    let essence = content_type
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default();

    match essence {
        "multipart/form-data" => decode_multipart(request, upload_dir).await,
        "application/x-www-form-urlencoded" => decode_urlencoded(request).await,
        "application/json" => decode_json(request).await,
        _ => Err(BodyError::UnsupportedContentType(essence.to_string())),
    }
}

async fn decode_multipart(request: Request, upload_dir: &Path) -> Result<DecodedBody, BodyError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| BodyError::from_status(rejection.status(), rejection.body_text()))?;
    let mut decoded = DecodedBody::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|error| BodyError::from_status(error.status(), error.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if field.file_name().is_some() {
            if name == SCREENSHOT_FIELD && decoded.screenshot.is_none() {
                let (upload, mut file) = TempUpload::create(upload_dir).await?;
                // Dropping `upload` on any early return removes the partial file.
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|error| BodyError::from_status(error.status(), error.body_text()))?
                {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                decoded.screenshot = Some(upload);
            } else {
                while field
                    .chunk()
                    .await
                    .map_err(|error| BodyError::from_status(error.status(), error.body_text()))?
                    .is_some()
                {}
            }
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|error| BodyError::from_status(error.status(), error.body_text()))?;
        push_field(&mut decoded.fields, name, value);
    }

    Ok(decoded)
}

async fn decode_urlencoded(request: Request) -> Result<DecodedBody, BodyError> {
    let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
        .await
        .map_err(|rejection| BodyError::from_status(rejection.status(), rejection.body_text()))?;
    let mut decoded = DecodedBody::default();
    for (name, value) in pairs {
        push_field(&mut decoded.fields, name, value);
    }
    Ok(decoded)
}

async fn decode_json(request: Request) -> Result<DecodedBody, BodyError> {
    let bytes = Bytes::from_request(request, &())
        .await
        .map_err(|rejection| BodyError::from_status(rejection.status(), rejection.body_text()))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(fields)) => Ok(DecodedBody {
            fields,
            screenshot: None,
        }),
        Ok(_) => Err(BodyError::NotAnObject),
        Err(error) => Err(BodyError::Malformed(error.to_string())),
    }
}

/// Repeated names collect into an array, which the validator rejects.
fn push_field(fields: &mut RawFields, name: String, value: String) {
    match fields.entry(name) {
        Entry::Vacant(slot) => {
            slot.insert(Value::String(value));
        }
        Entry::Occupied(mut slot) => {
            let existing = slot.get_mut();
            if let Value::Array(items) = existing {
                items.push(Value::String(value));
            } else {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
        }
    }
}

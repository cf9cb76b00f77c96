//! Local filenames for remote images.
//!
//! The image service serves IIIF URLs of the form
//! `https://host/iiif/<id>/full/<size>/0/default.jpg`, so every image ends in
//! the same `default.jpg`. For those the identifier between `/iiif/` and
//! `/full/` becomes the filename; any other URL keeps its final path segment.
//! The fetcher and the path annotator both go through [`local_filename`], so
//! the paths written into metadata match the files on disk.

use serde::Deserialize;
use thiserror::Error;

use crate::records::{field_str, Record};

const DEFAULT_FILENAME: &str = "default.jpg";
const IIIF_MARKER: &str = "/iiif/";
const FULL_MARKER: &str = "/full/";

/// How a record's image is named locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamingPolicy {
    /// IIIF identifier for `.../default.jpg` URLs, URL basename otherwise.
    #[default]
    Url,
    /// Last segment of the resource identifier plus the URL's extension.
    ResourceId,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("record has no image url")]
    MissingUrl,
    #[error("record has no resource identifier")]
    MissingResourceId,
    #[error("cannot parse IIIF identifier from url: {0}")]
    UnparseableUrl(String),
    #[error("url has no filename: {0}")]
    EmptyFilename(String),
}

/// A name that stays inside the image directory: one non-empty path
/// component that is not `.` or `..`.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Filename derived from an image URL alone.
pub fn filename_from_url(url: &str) -> Result<String, NamingError> {
    let url = url.trim();
    if url.ends_with(DEFAULT_FILENAME) {
        let id = url
            .split_once(IIIF_MARKER)
            .and_then(|(_, rest)| rest.split_once(FULL_MARKER))
            .map(|(id, _)| id)
            .filter(|id| is_plain_name(id))
            .ok_or_else(|| NamingError::UnparseableUrl(url.to_string()))?;
        return Ok(format!("{}.jpg", id));
    }

    match url.rsplit('/').next() {
        Some(name) if is_plain_name(name) => Ok(name.to_string()),
        Some(".") | Some("..") => Err(NamingError::UnparseableUrl(url.to_string())),
        _ => Err(NamingError::EmptyFilename(url.to_string())),
    }
}

/// Filename built from a stable resource identifier and the URL extension.
pub fn filename_from_resource(resource_uri: &str, url: &str) -> Result<String, NamingError> {
    let uuid = resource_uri
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| is_plain_name(s))
        .ok_or(NamingError::MissingResourceId)?;
    let extension = url.trim().rsplit('.').next().unwrap_or_default();
    let name = format!("{}.{}", uuid, extension);
    if !is_plain_name(&name) {
        return Err(NamingError::UnparseableUrl(url.trim().to_string()));
    }
    Ok(name)
}

/// Filename for a metadata record under `policy`.
pub fn local_filename(
    record: &Record,
    policy: NamingPolicy,
    url_field: &str,
    resource_field: &str,
) -> Result<String, NamingError> {
    let url = field_str(record, url_field).ok_or(NamingError::MissingUrl)?;
    match policy {
        NamingPolicy::Url => filename_from_url(url),
        NamingPolicy::ResourceId => {
            let resource =
                field_str(record, resource_field).ok_or(NamingError::MissingResourceId)?;
            filename_from_resource(resource, url)
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use strum::{AsRefStr, Display, EnumString};

use crate::services::storage::sanitize_component;

/// Terminal status of a job within one batch run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
    Pending,
}

/// Image formats the recognition service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum ImageMime {
    #[strum(to_string = "image/png")]
    Png,
    #[strum(to_string = "image/jpeg", serialize = "image/jpg")]
    Jpeg,
    #[strum(to_string = "image/webp")]
    Webp,
}

impl ImageMime {
    pub fn extension(self) -> &'static str {
        match self {
            ImageMime::Png => "png",
            ImageMime::Jpeg => "jpg",
            ImageMime::Webp => "webp",
        }
    }

    /// Sniff the format from the image header.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Png => Some(ImageMime::Png),
            image::ImageFormat::Jpeg => Some(ImageMime::Jpeg),
            image::ImageFormat::WebP => Some(ImageMime::Webp),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageMime::Png),
            "jpg" | "jpeg" => Some(ImageMime::Jpeg),
            "webp" => Some(ImageMime::Webp),
            _ => None,
        }
    }
}

/// One submitted image: `(bytes, name, MIME type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub name: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl JobInput {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, mime_type: Option<String>) -> Self {
        Self {
            name: name.into(),
            bytes,
            mime_type,
        }
    }
}

/// One image owned by the batch engine for the duration of a run.
#[derive(Debug, Clone)]
pub struct Job {
    /// Position in the submitted batch.
    pub index: usize,
    /// Original file name, unique within the batch.
    pub name: String,
    pub bytes: Vec<u8>,
    /// `None` when neither the declared type nor the header is a supported image.
    pub mime: Option<ImageMime>,
    /// Sanitized file name, with extension, used for stored copies.
    pub stored_name: String,
}

impl Job {
    /// Resolve the MIME type: the declared type when it is a supported image
    /// type, otherwise whatever the header sniffs as.
    pub fn from_input(index: usize, name: String, input: JobInput) -> Self {
        let declared = input
            .mime_type
            .as_deref()
            .and_then(|m| m.trim().to_ascii_lowercase().parse::<ImageMime>().ok());
        let mime = declared.or_else(|| ImageMime::sniff(&input.bytes));

        let mut job = Self {
            index,
            name,
            bytes: input.bytes,
            mime,
            stored_name: String::new(),
        };
        job.stored_name = if Path::new(&job.name).extension().is_some() {
            sanitize_component(&job.name)
        } else {
            sanitize_component(&format!("{}.{}", job.name, job.extension()))
        };
        job
    }

    /// File extension for stored copies.
    pub fn extension(&self) -> String {
        match self.mime {
            Some(mime) => mime.extension().to_string(),
            None => Path::new(&self.name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_else(|| "bin".to_string()),
        }
    }

    /// Stored name without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.stored_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.stored_name)
    }
}

/// Make original names unique within a batch by suffixing repeats
/// (`bill.png`, `bill-2.png`, ...).
pub fn unique_names<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    unique_names_avoiding(names, &HashSet::new())
}

/// Like [`unique_names`], but also steers clear of names in `reserved`.
pub fn unique_names_avoiding<'a, I>(names: I, reserved: &HashSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut taken: HashSet<String> = reserved.clone();
    let mut next_suffix: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();

    for name in names {
        let name = if name.trim().is_empty() { "image" } else { name };
        let mut candidate = name.to_string();
        if taken.contains(&candidate) {
            let path = Path::new(name);
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
            let ext = path.extension().and_then(|e| e.to_str());
            let n = next_suffix.entry(name.to_string()).or_insert(1);
            while taken.contains(&candidate) {
                *n += 1;
                candidate = match ext {
                    Some(ext) => format!("{stem}-{n}.{ext}"),
                    None => format!("{stem}-{n}"),
                };
            }
        }
        taken.insert(candidate.clone());
        out.push(candidate);
    }

    out
}

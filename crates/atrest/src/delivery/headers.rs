//! Response header computation for decrypting downloads.

use std::num::NonZeroU64;
use std::str::FromStr;
use std::time::Duration;

pub const CONTENT_DESCRIPTION: &str = "Content-Description";
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
pub const PRAGMA: &str = "Pragma";
pub const CACHE_CONTROL: &str = "Cache-Control";

/// Fallback MIME type for unknown extensions.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// `Content-Disposition` mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Attachment,
    Inline,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Attachment => "attachment",
            Disposition::Inline => "inline",
        }
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attachment" => Ok(Disposition::Attachment),
            "inline" => Ok(Disposition::Inline),
            other => Err(format!("unknown content disposition: {other}")),
        }
    }
}

/// Which name goes into the `filename` parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilenameSource {
    /// The name without the reserved suffix.
    #[default]
    Original,
    /// The on-disk name, suffix included. Kept for clients that depend on it.
    Stored,
}

impl FromStr for FilenameSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(FilenameSource::Original),
            "stored" => Ok(FilenameSource::Stored),
            other => Err(format!("unknown download filename source: {other}")),
        }
    }
}

/// How long a transfer is allowed to take. Advisory: hosts use it to extend
/// their own execution limits, it never aborts a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferBudget {
    Unlimited,
    Limited(Duration),
}

impl TransferBudget {
    /// `ceil(encrypted_size / min_bandwidth)` seconds, or unlimited when no
    /// minimum bandwidth is configured.
    pub fn for_size(encrypted_size: u64, min_bandwidth: Option<NonZeroU64>) -> Self {
        match min_bandwidth {
            None => TransferBudget::Unlimited,
            Some(bw) => TransferBudget::Limited(Duration::from_secs(
                encrypted_size.div_ceil(bw.get()),
            )),
        }
    }
}

/// MIME type for a file extension, matched case-insensitively.
pub fn mime_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "txt" | "text" | "log" => "text/plain",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "xml" => "text/xml",
        "md" => "text/markdown",
        "rtf" => "application/rtf",
        "js" => "application/javascript",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "tif" | "tiff" => "image/tiff",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        _ => OCTET_STREAM,
    }
}

/// Quote a filename for the `filename="…"` parameter.
///
/// Backslashes and double quotes are escaped; control characters are dropped.
pub fn quote_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars().filter(|c| !c.is_control()) {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Headers for a decrypting download, in emission order.
///
/// `Content-Length` is deliberately absent: the plaintext length is unknown
/// until the final chunk has been authenticated.
pub fn download_headers(
    disposition: Disposition,
    filename: &str,
    content_type: &str,
) -> Vec<(&'static str, String)> {
    vec![
        (CONTENT_DESCRIPTION, "File Transfer".to_owned()),
        (
            CONTENT_DISPOSITION,
            format!("{}; filename={}", disposition.as_str(), quote_filename(filename)),
        ),
        (CONTENT_TYPE, content_type.to_owned()),
        (CONTENT_TRANSFER_ENCODING, "binary".to_owned()),
        (PRAGMA, "no-cache".to_owned()),
        (CACHE_CONTROL, "private, no-cache, no-store".to_owned()),
    ]
}

/// Headers that turn a failed download into an inline plain-text page.
pub fn error_headers() -> [(&'static str, String); 2] {
    [
        (CONTENT_TYPE, "text/plain".to_owned()),
        (CONTENT_DISPOSITION, "inline".to_owned()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rounds_up() {
        let bw = NonZeroU64::new(1000);
        assert_eq!(
            TransferBudget::for_size(1001, bw),
            TransferBudget::Limited(Duration::from_secs(2))
        );
        assert_eq!(
            TransferBudget::for_size(1000, bw),
            TransferBudget::Limited(Duration::from_secs(1))
        );
        assert_eq!(
            TransferBudget::for_size(0, bw),
            TransferBudget::Limited(Duration::ZERO)
        );
    }

    #[test]
    fn budget_unlimited_without_bandwidth() {
        assert_eq!(TransferBudget::for_size(1 << 40, None), TransferBudget::Unlimited);
    }

    #[test]
    fn mime_lookup() {
        assert_eq!(mime_type("pdf"), "application/pdf");
        assert_eq!(mime_type("JPG"), "image/jpeg");
        assert_eq!(mime_type("enc"), OCTET_STREAM);
        assert_eq!(mime_type(""), OCTET_STREAM);
    }

    #[test]
    fn filename_is_quoted_and_escaped() {
        assert_eq!(quote_filename("my report.pdf"), "\"my report.pdf\"");
        assert_eq!(quote_filename("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(quote_filename("bad\r\nname"), "\"badname\"");
    }

    #[test]
    fn download_headers_are_complete() {
        let h = download_headers(Disposition::Attachment, "report.pdf", "application/pdf");
        let get = |n: &str| h.iter().find(|(k, _)| *k == n).map(|(_, v)| v.as_str());
        assert_eq!(get(CONTENT_DISPOSITION), Some("attachment; filename=\"report.pdf\""));
        assert_eq!(get(CONTENT_TYPE), Some("application/pdf"));
        assert_eq!(get(CONTENT_TRANSFER_ENCODING), Some("binary"));
        assert_eq!(get(PRAGMA), Some("no-cache"));
        assert_eq!(get(CACHE_CONTROL), Some("private, no-cache, no-store"));
        assert_eq!(get(CONTENT_LENGTH), None);
    }

    #[test]
    fn parses_config_values() {
        assert_eq!("Inline".parse::<Disposition>().unwrap(), Disposition::Inline);
        assert!("download".parse::<Disposition>().is_err());
        assert_eq!("stored".parse::<FilenameSource>().unwrap(), FilenameSource::Stored);
    }
}

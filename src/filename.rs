// SPDX-FileCopyrightText: 2025 The swiftget Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Filename hygiene for names that arrive from URLs and response
//! headers: strip characters the filesystem rejects, keep the result
//! bounded, and classify by extension.

const INVALID_CHARS: &str = "\\/:*?\"<>|";
const MAX_NAME_LEN: usize = 200;
pub const DEFAULT_NAME: &str = "download";

/// Replace forbidden characters and control bytes, trim trailing dots
/// and spaces, cap the length while preserving the extension, and never
/// return an empty name.
pub fn sanitize(filename: &str) -> String {
    let mut result: String = filename
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(c) || (c as u32) < 0x20 {
                '_'
            } else {
                c
            }
        })
        .collect();

    while result.ends_with(' ') || result.ends_with('.') {
        result.pop();
    }

    if result.is_empty() {
        return DEFAULT_NAME.to_string();
    }

    if result.chars().count() > MAX_NAME_LEN {
        let ext: String = match result.rfind('.') {
            Some(pos) if result.len() - pos <= 20 => result[pos..].to_string(),
            _ => String::new(),
        };
        let keep = MAX_NAME_LEN - ext.chars().count();
        let stem: String = result.chars().take(keep).collect();
        result = stem + &ext;
    }

    result
}

/// Derive a filename from the last path component of a URL, dropping
/// the query string and fragment and percent-decoding the result.
pub fn from_url(raw_url: &str) -> String {
    let parsed = match url::Url::parse(raw_url) {
        Ok(parsed) => parsed,
        Err(_) => return DEFAULT_NAME.to_string(),
    };

    let last = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last());

    match last {
        Some(candidate) => {
            let decoded = urlencoding::decode(candidate)
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| candidate.to_string());
            sanitize(&decoded)
        }
        None => DEFAULT_NAME.to_string(),
    }
}

pub fn extension(filename: &str) -> String {
    match filename.rfind('.') {
        Some(pos) if pos + 1 < filename.len() => filename[pos..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Bucket a file into a broad content category by extension.
pub fn categorize(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "mp3" | "wav" | "flac" | "aac" | "ogg" | "wma" | "m4a" | "opus" | "mid" => "Music",
        "mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv" | "webm" | "mpg" | "mpeg" | "3gp"
        | "m4v" => "Video",
        "exe" | "msi" | "apk" | "deb" | "rpm" | "bin" | "run" | "sh" | "bat" | "dmg" | "iso" => {
            "Programs"
        }
        "doc" | "docx" | "pdf" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "rtf" | "odt"
        | "csv" => "Documents",
        "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "xz" | "cab" => "Compressed",
        _ => "General",
    }
}

/// True for names the engine invented itself, which a Content-Disposition
/// name should override.
pub fn is_generic(filename: &str) -> bool {
    filename.is_empty() || filename == DEFAULT_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_forbidden_characters() {
        assert_eq!(sanitize("a<b>c:d\"e/f\\g|h?i*j.txt"), "a_b_c_d_e_f_g_h_i_j.txt");
        assert_eq!(sanitize("tab\there.bin"), "tab_here.bin");
    }

    #[test]
    fn trims_trailing_dots_and_spaces() {
        assert_eq!(sanitize("report.pdf.  "), "report.pdf");
        assert_eq!(sanitize("...."), DEFAULT_NAME);
        assert_eq!(sanitize(""), DEFAULT_NAME);
    }

    #[test]
    fn caps_length_keeping_extension() {
        let long = format!("{}.tar.gz", "x".repeat(400));
        let out = sanitize(&long);
        assert!(out.chars().count() <= 200);
        assert!(out.ends_with(".gz"));
    }

    #[test]
    fn url_extraction() {
        assert_eq!(from_url("https://example.com/files/archive.zip?token=abc"), "archive.zip");
        assert_eq!(from_url("https://example.com/files/na%C3%AFve.txt"), "naïve.txt");
        assert_eq!(from_url("https://example.com/"), DEFAULT_NAME);
        assert_eq!(from_url("https://example.com"), DEFAULT_NAME);
        assert_eq!(from_url("ftp://host/pub/tool.bin#frag"), "tool.bin");
    }

    #[test]
    fn categories() {
        assert_eq!(categorize(".mp3"), "Music");
        assert_eq!(categorize("mkv"), "Video");
        assert_eq!(categorize(".iso"), "Programs");
        assert_eq!(categorize(".pdf"), "Documents");
        assert_eq!(categorize(".7z"), "Compressed");
        assert_eq!(categorize(".xyz"), "General");
        assert_eq!(extension("a.TAR.GZ"), ".gz");
        assert_eq!(extension("noext"), "");
    }
}

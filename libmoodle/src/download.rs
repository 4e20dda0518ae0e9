use crate::errors::{MoodleError, Result};
use crate::model::{Course, FileEntry, Folder, FolderSection};
use crate::Update::{MessageUpdate, ProgressUpdate};
use crate::{DownloadRule, Message, Progress, Update};
use chrono::Utc;
use percent_encoding::percent_decode_str;
use phf::phf_map;
use reqwest::header::HeaderMap;
use reqwest::{header, Client};

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;
use url::Url;

#[derive(Debug)]
pub struct DownloadItem {
    pub link: Url,
    pub destination_dir: PathBuf,
    /// Name to save the file as. Worked out from the response when absent.
    pub file_name: Option<String>,
}

async fn notify(update_tx: &Sender<Update>, resource_name: &str, content: &str, is_error: bool) {
    if (update_tx
        .send(MessageUpdate(Message {
            content: content.into(),
            resource_name: resource_name.into(),
            is_error,
        }))
        .await)
        .is_err()
    {};
}

fn file_error(path: &Path, e: std::io::Error) -> MoodleError {
    MoodleError::FileOperationError {
        file_name: path.to_string_lossy().to_string(),
        message: format!("{} | {}", e, e.kind()),
    }
}

/// Downloads a file into `dld_item.destination_dir`, creating the directory when
/// needed. Returns the path of the written file, or `None` when the download rule
/// skipped it.
#[tracing::instrument(skip(client, update_tx))]
pub async fn download_file(
    client: &Client,
    mut dld_item: DownloadItem,
    rule: &DownloadRule,
    update_tx: Sender<Update>,
) -> Result<Option<PathBuf>> {
    let link_str = dld_item.link.to_string();
    if rule
        .black_list_urls
        .iter()
        .any(|blocked| link_str.contains(blocked.as_str()))
    {
        tracing::debug!("Skipping blacklisted link {}", link_str);
        return Ok(None);
    }

    let mut response = match client.get(dld_item.link.clone()).send().await {
        Err(e) => {
            tracing::error!("Error downloading file from {}", link_str);
            tracing::error!("{}", e);
            notify(&update_tx, &link_str, "Network error", true).await;
            return Err(MoodleError::NetworkError(e.to_string()));
        }
        Ok(r) => {
            if !r.status().is_success() {
                tracing::error!("Error status code received : {} |{}|", r.status(), link_str);
                notify(&update_tx, &link_str, "Error downloading resource", true).await;
                return Err(MoodleError::ErrorStatusCode {
                    status_code: r.status().to_string(),
                    url: link_str,
                });
            }
            r
        }
    };

    let headers = response.headers();
    let f_name = match dld_item.file_name.take().filter(|name| !name.trim().is_empty()) {
        Some(name) => sanitize_component(&name),
        None => {
            let f_ext = get_file_extension(&dld_item.link, headers);
            tracing::debug!("File extension for {} is {}", link_str, f_ext);
            sanitize_component(&get_file_name(&dld_item.link, headers, f_ext))
        }
    };
    let f_size = content_length(headers);

    if (f_size > 0 && f_size > rule.max_file_size)
        || (f_size == 0 && !rule.download_files_with_unknown_size)
    {
        tracing::debug!("Skipping {} ({} bytes) per download rule", link_str, f_size);
        notify(&update_tx, &f_name, "Skipped", false).await;
        return Ok(None);
    }

    if let Err(e) = fs::create_dir_all(&dld_item.destination_dir).await {
        tracing::error!("Failed to create destination directory\nError : {}", e);
        return Err(file_error(&dld_item.destination_dir, e));
    }

    dld_item.destination_dir.push(&f_name);
    let dest_path = dld_item.destination_dir;

    if f_size > 0 {
        if let Ok(metadata) = fs::metadata(&dest_path).await {
            if metadata.len() >= f_size {
                tracing::debug!(
                    "File : |{}| from |{}| has already been downloaded.",
                    dest_path.display(),
                    link_str
                );
                if (update_tx
                    .send(ProgressUpdate(Progress {
                        bytes_written: f_size,
                        file_size: f_size,
                        resource_name: f_name,
                    }))
                    .await)
                    .is_err()
                {};
                return Ok(Some(dest_path));
            }
        }
    }

    let mut dest_file = match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&dest_path)
        .await
    {
        Err(e) => {
            tracing::error!("Error opening/creating file {}", dest_path.display());
            tracing::error!("{} | {}", e, e.kind());
            notify(&update_tx, &f_name, "Error opening destination file", true).await;
            return Err(file_error(&dest_path, e));
        }
        Ok(f) => f,
    };

    let progress_update_interval = Duration::from_millis(rule.progress_update_interval);
    let mut last_update_time = Instant::now()
        .checked_sub(progress_update_interval)
        .unwrap_or_else(Instant::now);
    let mut bytes_written: u64 = 0;

    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Error downloading resource from {}", link_str);
                tracing::error!("{}", e);
                notify(&update_tx, &f_name, "Network error", true).await;
                return Err(MoodleError::NetworkError(e.to_string()));
            }
        };
        if let Err(e) = dest_file.write_all(&chunk).await {
            tracing::error!("Error writing to destination file {}", dest_path.display());
            tracing::error!("{} | {}", e, e.kind());
            notify(&update_tx, &f_name, "Error writing to file", true).await;
            return Err(file_error(&dest_path, e));
        }
        bytes_written += chunk.len() as u64;
        if Instant::now().duration_since(last_update_time) > progress_update_interval {
            match update_tx.try_send(ProgressUpdate(Progress {
                bytes_written,
                file_size: f_size,
                resource_name: f_name.to_owned(),
            })) {
                Err(TrySendError::Closed(_)) => return Err(MoodleError::ChannelClosed),
                Err(TrySendError::Full(_)) => {}
                Ok(()) => last_update_time = Instant::now(),
            }
        }
    }
    if let Err(e) = dest_file.flush().await {
        return Err(file_error(&dest_path, e));
    }

    tracing::debug!(
        "Download completed for {}, file @ {}",
        link_str,
        dest_path.display()
    );
    if (update_tx
        .send(ProgressUpdate(Progress {
            bytes_written,
            file_size: if f_size == 0 { bytes_written } else { f_size },
            resource_name: f_name,
        }))
        .await)
        .is_err()
    {};
    Ok(Some(dest_path))
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Where a file lands below `root`: course, section, folder, then the folders
/// the file sits in inside the file manager. Untitled sections are left out.
pub fn destination_dir(
    root: &Path,
    course: &Course,
    section: &FolderSection,
    folder: &Folder,
    entry: &FileEntry,
) -> PathBuf {
    let mut dir = root.join(sanitize_component(&course.title));
    if !section.title.trim().is_empty() {
        dir.push(sanitize_component(&section.title));
    }
    dir.push(sanitize_component(&folder.title));
    for name in entry.path.iter() {
        dir.push(sanitize_component(name));
    }
    dir
}

/// Makes a folder or file name from the portal safe to use as a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

#[tracing::instrument(skip(headers))]
fn get_file_name(link: &Url, headers: &HeaderMap, f_ext: &str) -> String {
    if let Some(name) = link
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|segment| !segment.is_empty())
    {
        return decode(name);
    }
    if let Some(name) = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(content_disposition_name)
    {
        return name;
    }
    tracing::warn!(
        "File name can't be determined, using generic name. {}",
        link.to_string()
    );
    format!(
        "file-{time}{ext}",
        time = Utc::now().format("%H%M%S%.3f"),
        ext = f_ext
    )
}

/// Undoes percent-encoding, e.g. `Week%201.pdf` becomes `Week 1.pdf`.
fn decode(encoded: &str) -> String {
    percent_decode_str(encoded).decode_utf8_lossy().to_string()
}

fn content_disposition_name(value: &str) -> Option<String> {
    // RFC 5987 style takes precedence, e.g. filename*=UTF-8''notes.pdf
    let name = if let Some(idx) = value.find("filename*=") {
        let encoded = value[idx + "filename*=".len()..].split(';').next()?;
        decode(encoded.rsplit('\'').next()?.trim())
    } else if let Some(idx) = value.find("filename=") {
        value[idx + "filename=".len()..]
            .split(';')
            .next()?
            .trim()
            .trim_matches('"')
            .to_string()
    } else {
        return None;
    };
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[tracing::instrument(skip(headers))]
fn get_file_extension(link: &Url, headers: &HeaderMap) -> &'static str {
    let content_type = match headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        None => {
            tracing::warn!("File extension can not be determined for {}", link);
            return "";
        }
        Some(ct) => ct.to_lowercase(),
    };
    // Remove charset if present (E.g text/html; charset=utf-8)
    let mime = content_type.split(';').next().unwrap_or("").trim();
    match MIME_TYPES.get(mime) {
        None => {
            tracing::warn!("File extension can not be determined for {}", link);
            ""
        }
        Some(ext) => ext,
    }
}

static MIME_TYPES: phf::Map<&'static str, &'static str> = phf_map! {
    "text/html" => ".html",
    "text/plain" => ".txt",
    "text/csv" => ".csv",
    "image/jpeg" => ".jpg",
    "image/png" => ".png",
    "image/gif" => ".gif",
    "application/json" => ".json",
    "application/pdf" => ".pdf",
    "application/zip" => ".zip",
    "application/msword" => ".doc",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
    "application/vnd.ms-powerpoint" => ".ppt",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation" => ".pptx",
    "application/vnd.ms-excel" => ".xls",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ".xlsx",
    "audio/mpeg" => ".mp3",
    "video/mp4" => ".mp4",
};

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{channel, Receiver};

    const PDF_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/pdf\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world";
    const UNSIZED_RESPONSE: &str = "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nhello";
    const NOT_FOUND_RESPONSE: &str =
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    /// Answers every connection on a local port with `response` and counts them.
    async fn serve(response: &'static str) -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        let link = Url::parse(&format!("http://{addr}/pluginfile.php/5/notes.pdf")).unwrap();
        (link, hits)
    }

    fn client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    /// A fresh, not yet existing directory under the system temp dir.
    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("libmoodle-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn item(link: Url, destination_dir: PathBuf) -> DownloadItem {
        DownloadItem {
            link,
            destination_dir,
            file_name: Some("notes.pdf".into()),
        }
    }

    async fn drain(mut update_rx: Receiver<Update>) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Some(update) = update_rx.recv().await {
            updates.push(update);
        }
        updates
    }

    fn last_progress(updates: &[Update]) -> Option<(u64, u64)> {
        updates.iter().rev().find_map(|update| match update {
            ProgressUpdate(p) => Some((p.bytes_written, p.file_size)),
            MessageUpdate(_) => None,
        })
    }

    fn headers(name: header::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_file_name_from_url_path() {
        let link = Url::parse(
            "https://moodle.example.edu/pluginfile.php/77/mod_folder/content/0/week1.pdf?forcedownload=1",
        )
        .unwrap();
        assert_eq!(get_file_name(&link, &HeaderMap::new(), ""), "week1.pdf");
    }

    #[test]
    fn test_file_name_from_content_disposition() {
        let link = Url::parse("https://moodle.example.edu/download/").unwrap();
        let quoted = headers(header::CONTENT_DISPOSITION, r#"attachment; filename="notes.pdf""#);
        assert_eq!(get_file_name(&link, &quoted, ""), "notes.pdf");
        let encoded = headers(
            header::CONTENT_DISPOSITION,
            "attachment; filename*=UTF-8''slides.pptx",
        );
        assert_eq!(get_file_name(&link, &encoded, ""), "slides.pptx");
    }

    #[test]
    fn test_generic_file_name_uses_content_type() {
        let link = Url::parse("https://moodle.example.edu/").unwrap();
        let headers = headers(header::CONTENT_TYPE, "application/pdf; charset=binary");
        let ext = get_file_extension(&link, &headers);
        assert_eq!(ext, ".pdf");
        let name = get_file_name(&link, &headers, ext);
        assert!(name.starts_with("file-"));
        assert!(name.ends_with(".pdf"));
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("Week 1 / Intro"), "Week 1 _ Intro");
        assert_eq!(sanitize_component("  notes?.pdf "), "notes_.pdf");
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("trailing..."), "trailing");
    }

    #[test]
    fn test_destination_dir() {
        let course = Course {
            title: "COMP1511".into(),
            url: "".into(),
        };
        let folder = Folder {
            title: "Lecture Slides".into(),
            url: "".into(),
        };
        let entry = FileEntry {
            url: "".into(),
            name: "a.pdf".into(),
            path: vec!["Week 1".into(), "Extra: Reading".into()],
        };
        let section = FolderSection {
            title: "Week 1".into(),
            folders: vec![folder.clone()],
        };
        assert_eq!(
            destination_dir(Path::new("out"), &course, &section, &folder, &entry),
            Path::new("out/COMP1511/Week 1/Lecture Slides/Week 1/Extra_ Reading")
        );
        let untitled = FolderSection {
            title: "".into(),
            folders: vec![],
        };
        assert_eq!(
            destination_dir(Path::new("out"), &course, &untitled, &folder, &entry),
            Path::new("out/COMP1511/Lecture Slides/Week 1/Extra_ Reading")
        );
    }

    #[test]
    fn test_file_names_are_percent_decoded() {
        let link =
            Url::parse("https://moodle.example.edu/pluginfile.php/5/Week%201%20Notes.pdf").unwrap();
        assert_eq!(get_file_name(&link, &HeaderMap::new(), ""), "Week 1 Notes.pdf");

        let link = Url::parse("https://moodle.example.edu/download/").unwrap();
        let encoded = headers(
            header::CONTENT_DISPOSITION,
            "attachment; filename*=UTF-8''Lab%20Sheet%20%231.pdf",
        );
        assert_eq!(get_file_name(&link, &encoded, ""), "Lab Sheet #1.pdf");
    }

    #[tokio::test]
    async fn test_blacklisted_link_is_never_requested() {
        let (link, hits) = serve(PDF_RESPONSE).await;
        let dir = scratch_dir("blacklisted");
        let rule = DownloadRule {
            black_list_urls: vec!["pluginfile.php".into()],
            ..DownloadRule::default()
        };
        let (tx, rx) = channel(16);
        let result = download_file(&client(), item(link, dir.clone()), &rule, tx).await;
        assert_eq!(result, Ok(None));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!dir.exists());
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_file_is_skipped_without_creating_directories() {
        let (link, hits) = serve(PDF_RESPONSE).await;
        let dir = scratch_dir("oversized").join("COMP1511");
        let rule = DownloadRule {
            max_file_size: 5,
            ..DownloadRule::default()
        };
        let (tx, rx) = channel(16);
        let result = download_file(&client(), item(link, dir.clone()), &rule, tx).await;
        assert_eq!(result, Ok(None));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!dir.exists());
        let updates = drain(rx).await;
        assert!(matches!(
            updates.as_slice(),
            [MessageUpdate(Message { is_error: false, .. })]
        ));
    }

    #[tokio::test]
    async fn test_unknown_size_follows_the_rule() {
        let (link, _) = serve(UNSIZED_RESPONSE).await;
        let dir = scratch_dir("unsized");
        let rule = DownloadRule {
            download_files_with_unknown_size: false,
            ..DownloadRule::default()
        };
        let (tx, _rx) = channel(16);
        let result = download_file(&client(), item(link.clone(), dir.clone()), &rule, tx).await;
        assert_eq!(result, Ok(None));
        assert!(!dir.exists());

        let (tx, rx) = channel(16);
        let result = download_file(&client(), item(link, dir.clone()), &DownloadRule::default(), tx)
            .await
            .unwrap();
        assert_eq!(result, Some(dir.join("notes.pdf")));
        assert_eq!(std::fs::read_to_string(dir.join("notes.pdf")).unwrap(), "hello");
        assert_eq!(last_progress(&drain(rx).await), Some((5, 5)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_complete_file_on_disk_is_kept() {
        let (link, _) = serve(PDF_RESPONSE).await;
        let dir = scratch_dir("complete");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("notes.pdf"), "HELLO WORLD").unwrap();
        let (tx, rx) = channel(16);
        let result = download_file(&client(), item(link, dir.clone()), &DownloadRule::default(), tx)
            .await
            .unwrap();
        assert_eq!(result, Some(dir.join("notes.pdf")));
        assert_eq!(
            std::fs::read_to_string(dir.join("notes.pdf")).unwrap(),
            "HELLO WORLD"
        );
        assert_eq!(last_progress(&drain(rx).await), Some((11, 11)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_download_writes_file_and_reports_completion() {
        let (link, hits) = serve(PDF_RESPONSE).await;
        let root = scratch_dir("full");
        let dir = root.join("COMP1511").join("Week 1");
        std::fs::create_dir_all(&dir).unwrap();
        // a shorter leftover from an interrupted download gets replaced
        std::fs::write(dir.join("notes.pdf"), "hel").unwrap();
        let (tx, rx) = channel(16);
        let result = download_file(&client(), item(link, dir.clone()), &DownloadRule::default(), tx)
            .await
            .unwrap();
        assert_eq!(result, Some(dir.join("notes.pdf")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read_to_string(dir.join("notes.pdf")).unwrap(),
            "hello world"
        );
        let updates = drain(rx).await;
        assert!(matches!(updates.last(), Some(ProgressUpdate(_))));
        assert_eq!(last_progress(&updates), Some((11, 11)));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (link, _) = serve(NOT_FOUND_RESPONSE).await;
        let dir = scratch_dir("missing");
        let (tx, rx) = channel(16);
        let rule = DownloadRule::default();
        let result = download_file(&client(), item(link.clone(), dir.clone()), &rule, tx).await;
        assert_eq!(
            result,
            Err(MoodleError::ErrorStatusCode {
                status_code: "404 Not Found".into(),
                url: link.to_string(),
            })
        );
        assert!(!dir.exists());
        let updates = drain(rx).await;
        assert!(matches!(
            updates.as_slice(),
            [MessageUpdate(Message { is_error: true, .. })]
        ));
    }
}

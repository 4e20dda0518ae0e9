use crate::download::DownloadItem;
use crate::link::{get_full_link, portal_root, resolve_or_keep};
use reqwest::header::ETAG;
use scraper::Html;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::mpsc::Sender;
use tracing::instrument;
use url::Url;

pub mod download;
mod errors;
pub mod extract;
pub mod link;
mod model;
pub mod session;
pub mod tree;

pub use errors::{MoodleError, Result};
pub use model::{Course, FileEntry, Folder, FolderSection};
pub use session::{AuthState, HttpResponse, HttpSession, Session, Transport};

const DEFAULT_MAX_FILE_SIZE: u64 = 500_000_000;
const DEFAULT_PROGRESS_UPDATE_INTERVAL: u64 = 1000;

#[derive(Debug, Clone)]
pub struct DownloadRule {
    /// Maximum size in bytes for files to download
    pub max_file_size: u64,
    pub download_files_with_unknown_size: bool,
    /// Progress update interval in millisecond
    pub progress_update_interval: u64,
    /// Links containing any of these texts are not downloaded.
    pub black_list_urls: Vec<String>,
}

impl Default for DownloadRule {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            download_files_with_unknown_size: true,
            progress_update_interval: DEFAULT_PROGRESS_UPDATE_INTERVAL,
            black_list_urls: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum Update {
    MessageUpdate(Message),
    ProgressUpdate(Progress),
}

#[derive(Debug)]
pub struct Message {
    pub content: String,
    pub resource_name: String,
    pub is_error: bool,
}

#[derive(Debug)]
pub struct Progress {
    pub bytes_written: u64,
    pub file_size: u64,
    pub resource_name: String,
}

/// A client for one user on one portal.
///
/// Every course, folder and file call needs a successful [`Moodle::login`] first and
/// fails with [`MoodleError::NotAuthenticated`] without touching the network otherwise.
#[derive(Debug)]
pub struct Moodle<T> {
    base_url: Url,
    session: Session<T>,
    /// Course list from the last [`Moodle::get_courses`] call
    courses: Vec<Course>,
}

impl Moodle<HttpSession> {
    pub fn connect(base_url: &str) -> Result<Self> {
        Self::with_transport(base_url, HttpSession::new()?)
    }

    /// Streams `entry` into `destination_dir`, named after the entry.
    pub async fn download_file(
        &self,
        entry: &FileEntry,
        destination_dir: PathBuf,
        rule: &DownloadRule,
        update_tx: Sender<Update>,
    ) -> Result<Option<PathBuf>> {
        let transport = self.session.require_auth()?;
        let link = self.resolve(&entry.url)?;
        download::download_file(
            transport.client(),
            DownloadItem {
                link,
                destination_dir,
                file_name: Some(entry.name.clone()),
            },
            rule,
            update_tx,
        )
        .await
    }
}

impl<T: Transport> Moodle<T> {
    /// Only the scheme, host and port of `base_url` are kept.
    pub fn with_transport(base_url: &str, transport: T) -> Result<Self> {
        let base_url = match portal_root(base_url) {
            Some(url) => url,
            None => return Err(MoodleError::InvalidUrl(base_url.to_string())),
        };
        Ok(Self {
            base_url,
            session: Session::new(transport),
            courses: Vec::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn auth_state(&self) -> AuthState {
        self.session.state()
    }

    /// Courses from the last successful [`Moodle::get_courses`].
    pub fn courses(&self) -> &[Course] {
        &self.courses
    }

    pub fn course(&self, title: &str) -> Result<&Course> {
        self.courses
            .iter()
            .find(|course| course.title == title)
            .ok_or_else(|| MoodleError::InvalidCourseReference(title.to_string()))
    }

    fn resolve(&self, link: &str) -> Result<Url> {
        get_full_link(link, &self.base_url).ok_or_else(|| MoodleError::InvalidUrl(link.to_string()))
    }

    /// Logs in with a username and password. A session logs in once; a failed
    /// attempt leaves it logged out so the caller can try again.
    #[instrument(skip(self, password))]
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.session.begin_login()?;
        tracing::info!("Logging in user {}...", username);
        let result = self.authenticate(username, password).await;
        self.session.finish_login(result.is_ok());
        match &result {
            Ok(_) => tracing::info!("Logged in as {}", username),
            Err(e) => tracing::error!("Error on login: {}", e),
        }
        result
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let login_url = match self.session.login_url.clone() {
            Some(url) => url,
            None => {
                let url = self.session.redirect_location(&self.base_url).await?;
                tracing::debug!("Login page is at {}", url);
                self.session.login_url = Some(url.clone());
                url
            }
        };

        let login_page = self
            .session
            .transport
            .get(&login_url)
            .await?
            .require_success(&login_url)?;
        let token = login_token(&login_page.body);

        let mut form = vec![("username", username), ("password", password)];
        if let Some(token) = token.as_deref() {
            form.push(("logintoken", token));
        }
        let response = self.session.transport.post(&login_url, &form).await?;
        check_login_response(&response, &login_url, username)
    }

    /// Gets the courses listed on the user's home page and remembers them for
    /// [`Moodle::get_folders_in_course`].
    #[instrument(skip(self))]
    pub async fn get_courses(&mut self) -> Result<Vec<Course>> {
        self.session.require_auth()?;
        let home_url = match self.session.home_url.clone() {
            Some(url) => url,
            None => {
                let url = self.session.redirect_location(&self.base_url).await?;
                tracing::debug!("Home page is at {}", url);
                self.session.home_url = Some(url.clone());
                url
            }
        };
        let page = self
            .session
            .transport
            .get(&home_url)
            .await?
            .require_success(&home_url)?;
        let courses = parse_courses(&page.body, &home_url);
        tracing::info!("Course list obtained! {} course(s)", courses.len());
        self.courses = courses.clone();
        Ok(courses)
    }

    /// Gets the folder sections of a course from the last retrieved course list.
    #[instrument(skip(self))]
    pub async fn get_folders_in_course(&self, title: &str) -> Result<Vec<FolderSection>> {
        self.session.require_auth()?;
        let course = self.course(title)?;
        let course_url = self.resolve(&course.url)?;
        self.get_folders_at(&course_url).await
    }

    /// Gets the folder sections of the course page at `course_url`.
    #[instrument(skip(self))]
    pub async fn get_folders_at(&self, course_url: &Url) -> Result<Vec<FolderSection>> {
        let transport = self.session.require_auth()?;
        let page = transport
            .get(course_url)
            .await?
            .require_success(course_url)?;
        let sections = parse_folder_sections(&page.body, course_url);
        tracing::info!("Folder list for {} obtained!", course_url);
        Ok(sections)
    }

    /// Gets every file below the file manager at `folder_url`, in document order.
    #[instrument(skip(self))]
    pub async fn get_files_in_folder(&self, folder_url: &str) -> Result<Vec<FileEntry>> {
        let transport = self.session.require_auth()?;
        let folder_url = self.resolve(folder_url)?;
        let page = transport
            .get(&folder_url)
            .await?
            .require_success(&folder_url)?;
        let files = parse_files(&page.body, &folder_url);
        tracing::info!("{} file(s) found in {}", files.len(), folder_url);
        Ok(files)
    }

    /// The `ETag` the portal reports for a file, if any.
    #[instrument(skip(self))]
    pub async fn file_etag(&self, file_url: &str) -> Result<Option<String>> {
        let transport = self.session.require_auth()?;
        let file_url = self.resolve(file_url)?;
        let headers = transport.head(&file_url).await?;
        Ok(headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }
}

fn login_token(body: &str) -> Option<String> {
    extract::get_login_token(&Html::parse_document(body))
}

/// A login the portal accepted either redirects somewhere other than the bare
/// login page (a `testsession` check counts as accepted) or renders a page
/// without a login form. A redirect without a `Location` is not accepted.
fn check_login_response(response: &HttpResponse, login_url: &Url, username: &str) -> Result<()> {
    if response.status.is_redirection() {
        let Some(location) = response.redirect_location(login_url) else {
            tracing::error!("Login redirect without a usable Location header");
            return Err(MoodleError::LoginRejected(username.to_string()));
        };
        let back_to_login = location.path() == login_url.path()
            && !location.query_pairs().any(|(key, _)| key == "testsession");
        if back_to_login {
            return Err(MoodleError::LoginRejected(username.to_string()));
        }
        return Ok(());
    }
    if !response.status.is_success() {
        return Err(MoodleError::ErrorStatusCode {
            status_code: response.status.to_string(),
            url: login_url.to_string(),
        });
    }
    if extract::is_login_form(&Html::parse_document(&response.body)) {
        return Err(MoodleError::LoginRejected(username.to_string()));
    }
    Ok(())
}

fn parse_courses(body: &str, page_url: &Url) -> Vec<Course> {
    let document = Html::parse_document(body);
    let mut seen = HashSet::new();
    extract::get_courses(&document)
        .into_iter()
        .map(|course| Course {
            title: course.title.trim().to_string(),
            ..course
        })
        .filter(|course| {
            let first = seen.insert(course.title.clone());
            if !first {
                tracing::warn!("Dropping duplicate course \"{}\"", course.title);
            }
            first
        })
        .map(|course| Course {
            url: resolve_or_keep(&course.url, page_url),
            ..course
        })
        .collect()
}

fn parse_folder_sections(body: &str, page_url: &Url) -> Vec<FolderSection> {
    let document = Html::parse_document(body);
    extract::get_folder_sections(&document)
        .into_iter()
        .map(|section| FolderSection {
            folders: section
                .folders
                .into_iter()
                .map(|folder| Folder {
                    title: folder.title.trim().to_string(),
                    url: resolve_or_keep(&folder.url, page_url),
                })
                .collect(),
            ..section
        })
        .collect()
}

fn parse_files(body: &str, page_url: &Url) -> Vec<FileEntry> {
    let document = Html::parse_document(body);
    tree::get_files(&document)
        .into_iter()
        .map(|file| FileEntry {
            url: resolve_or_keep(&file.url, page_url),
            ..file
        })
        .collect()
}

use std::fmt::Formatter;

#[derive(Debug, PartialEq)]
pub enum MoodleError {
    /// A course, folder or file operation was attempted before logging in.
    NotAuthenticated,
    /// `login` was called on a session that is already authenticated.
    AlreadyAuthenticated,
    /// The portal answered the login attempt with its login form again.
    LoginRejected(String),
    /// Parameter is the course title that was looked up
    InvalidCourseReference(String),
    NetworkError(String),
    ErrorStatusCode {
        status_code: String,
        url: String,
    },
    /// parameters are file path, additional error message
    FileOperationError {
        file_name: String,
        message: String,
    },
    ChannelClosed,
    InvalidUrl(String),
}

impl std::fmt::Display for MoodleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            MoodleError::NotAuthenticated => "not logged in, call login first".to_string(),
            MoodleError::AlreadyAuthenticated => "session is already logged in".to_string(),
            MoodleError::LoginRejected(user) => {
                format!("login was rejected for user {user}")
            }
            MoodleError::InvalidCourseReference(title) => {
                format!("no course named \"{title}\" in the retrieved course list")
            }
            MoodleError::NetworkError(err) => format!("error connecting to the portal. {err}"),
            MoodleError::ErrorStatusCode { status_code, url } => {
                format!("server returned an error response. {url} => {status_code}")
            }
            MoodleError::FileOperationError { file_name, message } => {
                format!("{message} : {file_name}")
            }
            MoodleError::ChannelClosed => "Channel closed before download completion".to_string(),
            MoodleError::InvalidUrl(url) => format!("Invalid url received : {url}"),
        };
        write!(f, "{str}")
    }
}

impl std::error::Error for MoodleError {}

impl From<reqwest::Error> for MoodleError {
    fn from(e: reqwest::Error) -> Self {
        match (e.status(), e.url()) {
            (Some(status), Some(url)) => MoodleError::ErrorStatusCode {
                status_code: status.to_string(),
                url: url.to_string(),
            },
            _ => MoodleError::NetworkError(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MoodleError>;

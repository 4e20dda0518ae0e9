use serde::Serialize;

/// A course the logged in user is enrolled in. Titles are unique within one course list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Course {
    pub title: String,
    pub url: String,
}

/// A named group of folders on a course page, e.g. "Week 1 Lectures".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderSection {
    pub title: String,
    /// Folders in document order
    pub folders: Vec<Folder>,
}

/// A link into a file manager page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Folder {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub url: String,
    pub name: String,
    /// Names of the enclosing folders, root first. Empty for files at the root
    /// of the file manager.
    pub path: Vec<String>,
}

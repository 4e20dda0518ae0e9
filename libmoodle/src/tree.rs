//! Walks the nested list a file manager page renders and flattens it into
//! [`FileEntry`] records carrying the names of their enclosing folders.
use crate::model::FileEntry;
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};

lazy_static! {
    static ref FILE_MANAGER_ROOT: Selector = Selector::parse("div.filemanager > ul").unwrap();
    static ref LINK: Selector = Selector::parse("a").unwrap();
    static ref FILE_ICON: Selector = Selector::parse("img.smallicon").unwrap();
    static ref IMG: Selector = Selector::parse("img").unwrap();
}

/// What a single list item in the file manager stands for.
#[derive(Debug)]
enum Item<'a> {
    /// A file link; the item has a `span` child.
    File(ElementRef<'a>),
    /// A folder; the item starts with a `div` header followed by zero or more
    /// nested lists. No nested list means the folder is empty.
    Folder {
        header: ElementRef<'a>,
        lists: Vec<ElementRef<'a>>,
    },
    Unknown,
}

fn element_children<'a>(element: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    element.children().filter_map(ElementRef::wrap)
}

fn classify(item: ElementRef<'_>) -> Item<'_> {
    if element_children(item).any(|child| child.value().name() == "span") {
        return Item::File(item);
    }
    match element_children(item).next() {
        Some(first) if first.value().name() == "div" => Item::Folder {
            header: first,
            lists: element_children(item)
                .filter(|child| child.value().name() == "ul")
                .collect(),
        },
        _ => Item::Unknown,
    }
}

fn file_entry(item: ElementRef, path: &[String]) -> FileEntry {
    let url = item
        .select(&LINK)
        .next()
        .and_then(|link| link.value().attr("href"))
        .unwrap_or("");
    let name = item
        .select(&FILE_ICON)
        .next()
        .and_then(|icon| icon.value().attr("alt"))
        .unwrap_or("");
    FileEntry {
        url: url.to_string(),
        name: name.to_string(),
        path: path.to_vec(),
    }
}

fn folder_name(header: ElementRef) -> String {
    header
        .select(&IMG)
        .next()
        .and_then(|icon| icon.value().attr("title"))
        .unwrap_or("")
        .to_string()
}

/// Collects every file below `list`, in document order, into `files`.
/// `path` holds the folder names leading to `list`.
pub fn walk_list(list: ElementRef, path: &[String], files: &mut Vec<FileEntry>) {
    for item in element_children(list) {
        match classify(item) {
            Item::File(item) => files.push(file_entry(item, path)),
            Item::Folder { header, lists } => {
                let name = folder_name(header);
                if lists.is_empty() {
                    tracing::debug!("Folder \"{}\" is empty", name);
                    continue;
                }
                let mut child_path = path.to_vec();
                child_path.push(name);
                for nested in lists {
                    walk_list(nested, &child_path, files);
                }
            }
            Item::Unknown => {
                tracing::warn!(
                    "Skipping unrecognised file manager item <{}> under /{}",
                    item.value().name(),
                    path.join("/")
                );
            }
        }
    }
}

/// Gets every file listed on a file manager page.
pub fn get_files(document: &Html) -> Vec<FileEntry> {
    let mut files = Vec::new();
    for root in document.select(&FILE_MANAGER_ROOT) {
        walk_list(root, &[], &mut files);
    }
    files
}

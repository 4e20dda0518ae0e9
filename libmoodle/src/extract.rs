//! Pure extractors turning portal pages into typed records.
//!
//! Links are returned exactly as they appear in the markup; resolving them
//! against the page url is left to the caller.
use crate::model::{Course, Folder, FolderSection};
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Node, Selector};

lazy_static! {
    static ref COURSE_LINK: Selector = Selector::parse("div .course_title a").unwrap();
    static ref SECTION: Selector = Selector::parse("li.section.main.clearfix").unwrap();
    static ref FOLDER_LINK: Selector = Selector::parse("li.folder a").unwrap();
    static ref LOGIN_TOKEN: Selector = Selector::parse(r#"input[name="logintoken"]"#).unwrap();
    static ref LOGIN_FORM: Selector =
        Selector::parse(r#"form#login, input[name="password"]"#).unwrap();
}

/// Gets every course link on the dashboard, in document order.
pub fn get_courses(document: &Html) -> Vec<Course> {
    document.select(&COURSE_LINK).map(course_from_link).collect()
}

pub fn course_from_link(link: ElementRef) -> Course {
    Course {
        title: link.text().collect::<String>(),
        url: link.value().attr("href").unwrap_or("").to_string(),
    }
}

/// Gets the sections of a course page together with the folders listed in each.
pub fn get_folder_sections(document: &Html) -> Vec<FolderSection> {
    document.select(&SECTION).map(folder_section).collect()
}

pub fn folder_section(section: ElementRef) -> FolderSection {
    FolderSection {
        title: section.value().attr("aria-label").unwrap_or("").to_string(),
        folders: section.select(&FOLDER_LINK).map(folder_from_link).collect(),
    }
}

/// The folder name lives in the link's `span` label. The label carries a nested
/// `span` (an accessibility suffix like " Folder") which is left out.
pub fn folder_from_link(link: ElementRef) -> Folder {
    let mut title = String::new();
    collect_label_text(link, 0, &mut title);
    Folder {
        title,
        url: link.value().attr("href").unwrap_or("").to_string(),
    }
}

/// Appends text found directly under an outermost `span`. `span_depth` counts the
/// `span` elements between `element` and the link.
fn collect_label_text(element: ElementRef, span_depth: usize, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) if span_depth == 1 => out.push_str(text),
            Node::Element(el) => {
                let Some(child_element) = ElementRef::wrap(child) else {
                    continue;
                };
                if el.name() != "span" {
                    collect_label_text(child_element, span_depth, out);
                } else if span_depth == 0 {
                    collect_label_text(child_element, 1, out);
                }
            }
            _ => {}
        }
    }
}

/// The hidden token newer portals require alongside the credentials.
pub fn get_login_token(document: &Html) -> Option<String> {
    document
        .select(&LOGIN_TOKEN)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::to_string)
}

/// True when the page shows a login form, i.e. the session isn't logged in.
pub fn is_login_form(document: &Html) -> bool {
    document.select(&LOGIN_FORM).next().is_some()
}

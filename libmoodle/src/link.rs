use tracing::{event, instrument, Level};
use url::{ParseError, Url};

#[instrument]
/// Get the full link to a page or file, given the url of the page it was found on.
pub fn get_full_link(link: &str, page_url: &Url) -> Option<Url> {
    if link.is_empty() {
        return None;
    }
    match Url::parse(link) {
        Ok(url) => Some(url),
        Err(e)
            if e == ParseError::EmptyHost
                || e == ParseError::RelativeUrlWithoutBase
                || e == ParseError::RelativeUrlWithCannotBeABaseBase =>
        {
            match page_url.join(link) {
                Ok(url) => Some(url),
                Err(e) => {
                    event!(Level::ERROR, "Failed to join {} onto {}", link, page_url);
                    event!(Level::ERROR, "{}", e);
                    None
                }
            }
        }
        Err(e) => {
            event!(Level::ERROR, "Failed to get full link for {}", link);
            event!(Level::ERROR, "{}", e);
            None
        }
    }
}

/// Resolves `link` against `page_url`, keeping it verbatim when it can't be resolved.
pub(crate) fn resolve_or_keep(link: &str, page_url: &Url) -> String {
    match get_full_link(link, page_url) {
        Some(url) => url.to_string(),
        None => {
            if !link.is_empty() {
                tracing::warn!("Keeping unresolvable link {} as is", link);
            }
            link.to_string()
        }
    }
}

/// Strips a portal url down to `scheme://host[:port]/`.
pub fn portal_root(link: &str) -> Option<Url> {
    let url = Url::parse(link).ok()?;
    if url.cannot_be_a_base() || url.host().is_none() {
        return None;
    }
    Url::parse(&url.origin().ascii_serialization()).ok()
}

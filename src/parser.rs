use scraper::{Html, Node, Selector};
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

use crate::models::FeaturePayload;

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").expect("Invalid CSS selector"));
static ANCHORS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").expect("Invalid CSS selector"));
static IMAGES: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").expect("Invalid CSS selector"));

/// Elements whose descendant text is never visible content.
const HIDDEN_TEXT_PARENTS: [&str; 7] = ["script", "style", "noscript", "head", "meta", "svg", "title"];

/// Extract page features in emission order: title, text, links, images.
///
/// Relative links and image sources are resolved against `base`
/// (normally `method://address/`).
///
/// # Examples
/// ```
/// use quadscan::models::FeaturePayload;
/// use quadscan::parser::extract_features;
/// use url::Url;
///
/// let base = Url::parse("https://198.51.100.7/").unwrap();
/// let features = extract_features("<title> Hi </title><a href=\"/x\">x</a>", &base);
/// assert_eq!(features[0], FeaturePayload::Title("Hi".into()));
/// assert_eq!(features[2], FeaturePayload::Link("https://198.51.100.7/x".into()));
/// ```
pub fn extract_features(html_body: &str, base: &Url) -> Vec<FeaturePayload> {
    if html_body.trim().is_empty() {
        return Vec::new();
    }
    let document = Html::parse_document(html_body);

    let mut features = Vec::new();
    if let Some(title) = extract_title(&document) {
        features.push(FeaturePayload::Title(title));
    }
    let text = extract_visible_text(&document);
    if !text.is_empty() {
        features.push(FeaturePayload::Text(text));
    }
    features.extend(extract_links(&document, base).into_iter().map(FeaturePayload::Link));
    features.extend(extract_images(&document, base).into_iter().map(FeaturePayload::Image));
    features
}

fn extract_title(document: &Html) -> Option<String> {
    let title = document.select(&TITLE).next()?;
    let text = title.text().collect::<String>().trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn extract_visible_text(document: &Html) -> String {
    let mut words: Vec<&str> = Vec::new();
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|el| HIDDEN_TEXT_PARENTS.contains(&el.name()))
                .unwrap_or(false)
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

fn extract_links(document: &Html, base: &Url) -> Vec<String> {
    let mut unique = UniqueUrls::default();
    for element in document.select(&ANCHORS) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        let lower = href.to_ascii_lowercase();
        if href.is_empty() || href.starts_with('#') || lower.starts_with("javascript:") || lower.starts_with("mailto:") {
            continue;
        }
        unique.insert(absolutize(base, href));
    }
    unique.into_vec()
}

fn extract_images(document: &Html, base: &Url) -> Vec<String> {
    let mut unique = UniqueUrls::default();
    for element in document.select(&IMAGES) {
        let Some(src) = element.value().attr("src") else {
            continue;
        };
        let src = src.trim();
        if src.is_empty() || src.to_ascii_lowercase().starts_with("data:") {
            continue;
        }
        unique.insert(absolutize(base, src));
    }
    unique.into_vec()
}

/// Absolute targets pass through; anything unresolvable is kept verbatim.
fn absolutize(base: &Url, candidate: &str) -> String {
    match base.join(candidate) {
        Ok(url) => url.to_string(),
        Err(_) => candidate.to_string(),
    }
}

/// First-seen order, case-insensitive uniqueness.
#[derive(Default)]
struct UniqueUrls {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl UniqueUrls {
    fn insert(&mut self, url: String) {
        if self.seen.insert(url.to_lowercase()) {
            self.ordered.push(url);
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

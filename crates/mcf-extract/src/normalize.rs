use scraper::{ElementRef, Html};

/// Elements dropped along with everything beneath them.
const STRIPPED_ELEMENTS: &[&str] = &["script", "style", "nav", "footer", "header"];

/// Plain text of a page plus the anchor targets found in its retained content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedPage {
    pub text: String,
    pub links: Vec<String>,
}

pub fn normalize(raw_html: &str) -> NormalizedPage {
    let document = Html::parse_document(raw_html);
    let mut chunks: Vec<&str> = Vec::new();
    let mut links = Vec::new();

    // Explicit stack: page nesting depth is attacker controlled.
    let mut stack = vec![*document.root_element()];
    while let Some(node) = stack.pop() {
        if let Some(element) = ElementRef::wrap(node) {
            let name = element.value().name();
            if STRIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            if name == "a" {
                if let Some(href) = element.value().attr("href").map(str::trim) {
                    if !href.is_empty() {
                        links.push(href.to_string());
                    }
                }
            }
            stack.extend(node.children().rev());
        } else if let Some(text) = node.value().as_text() {
            chunks.push(text);
        }
    }

    NormalizedPage {
        text: collapse_whitespace(&chunks.join(" ")),
        links,
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

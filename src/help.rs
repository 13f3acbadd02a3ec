use crate::protocol::ReplContent;

pub const HELP_URL_PREFIX: &str = "http://magma.maths.usyd.edu.au/magma/handbook/search?chapters=1&examples=1&intrinsics=1&query=";

pub fn help_url(keyword: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(keyword.as_bytes()).collect();
    format!("{HELP_URL_PREFIX}{encoded}")
}

/// Display payload linking to the handbook search for `keyword`.
pub fn help_content(keyword: &str) -> ReplContent {
    let url = help_url(keyword);
    ReplContent::ContentDisplay {
        html: format!(
            "<a href=\"{}\" target=\"magma_help\">Magma help on {}</a>",
            escape_html(&url),
            escape_html(keyword)
        ),
        plain: format!("Link to {url}"),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Markup that makes a message worth converting. Anything else is passed
/// through untouched so stray `<` characters survive.
const HTML_MARKERS: &[&str] = &[
    "<div", "<p ", "<p>", "<img ", "<h1>", "<h2>", "<h3>", "<ol>", "<ul>", "<table>", "<hr>",
];

macro_rules! lazy_regex {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> =
            Lazy::new(|| Regex::new($pattern).expect("valid markdown regex"));
    };
}

lazy_regex!(BOLD_RE, r"<(?:b|strong)(?:\s[^>]*)?>([^<]*)</(?:b|strong)>");
lazy_regex!(ITALIC_RE, r"<(?:i|em)(?:\s[^>]*)?>([^<]*)</(?:i|em)>");
lazy_regex!(STRIKE_RE, r"<(?:s|del|strike)(?:\s[^>]*)?>([^<]*)</(?:s|del|strike)>");
lazy_regex!(CODE_RE, r"<code(?:\s[^>]*)?>([^<]*)</code>");
lazy_regex!(SPAN_RE, r"<span(?:\s[^>]*)?>([^<]*)</span>");
lazy_regex!(LINK_RE, r"<a\s([^>]*)>([^<]*)</a>");
lazy_regex!(IMG_RE, r"<img\s([^>]*?)/?>");
lazy_regex!(ATTR_RE, r#"([A-Za-z-]+)=(?:"([^"]*)"|'([^']*)')"#);
lazy_regex!(TABLE_RE, r"(?s)<table[^>]*>(.*?)</table>");
lazy_regex!(ROW_RE, r"(?s)<tr[^>]*>(.*?)</tr>");
lazy_regex!(CELL_RE, r"(?s)<t([hd])[^>]*>(.*?)</t[hd]>");
lazy_regex!(OL_RE, r"(?s)<ol[^>]*>(.*?)</ol>");
lazy_regex!(UL_RE, r"(?s)<ul[^>]*>(.*?)</ul>");
lazy_regex!(LI_RE, r"(?s)<li[^>]*>(.*?)</li>");
lazy_regex!(HEADING_RE, r"(?s)<h([1-6])[^>]*>(.*?)</h[1-6]>");
lazy_regex!(BLOCK_RE, r"</?(?:p|div)(?:\s[^>]*)?>|<hr\s*/?>");
lazy_regex!(BR_RE, r"<br\s*/?>");
lazy_regex!(TAG_RE, r"<[^>]*>");
lazy_regex!(SPACES_RE, r"[ \t]{2,}");
lazy_regex!(MD_CODE_RE, r"`([^`]+)`");
lazy_regex!(MD_BOLD_RE, r"\*\*([^*]+)\*\*");
lazy_regex!(MD_STRIKE_RE, r"~~([^~]+)~~");
lazy_regex!(MD_ITALIC_RE, r"\b_([^_]+)_\b");
lazy_regex!(MD_LINK_RE, r"\[([^\]]+)\]\(([^)\s]+)\)");
lazy_regex!(PARAGRAPH_RE, r"\n{2,}");

/// Converts the HTML flavour used by remote messages into markdown.
pub fn convert_to_markdown(text: &str) -> String {
    if !HTML_MARKERS.iter().any(|marker| text.contains(marker)) {
        return text.to_string();
    }

    let mut result = text.replace("&nbsp;", " ");
    result = convert_inline(&result);
    result = TABLE_RE
        .replace_all(&result, |caps: &Captures| convert_table(&caps[1]))
        .into_owned();
    result = OL_RE
        .replace_all(&result, |caps: &Captures| convert_list(&caps[1], true))
        .into_owned();
    result = UL_RE
        .replace_all(&result, |caps: &Captures| convert_list(&caps[1], false))
        .into_owned();
    result = HEADING_RE
        .replace_all(&result, |caps: &Captures| {
            let level: usize = caps[1].parse().unwrap_or(1);
            format!("\n\n{} {}\n\n", "#".repeat(level), plain_text(&caps[2]))
        })
        .into_owned();
    result = BR_RE.replace_all(&result, "\n").into_owned();
    result = BLOCK_RE.replace_all(&result, "\n\n").into_owned();
    result = TAG_RE.replace_all(&result, "").into_owned();
    normalize_lines(&decode_entities(&result))
}

fn convert_inline(html: &str) -> String {
    let mut current = html.to_string();
    // Innermost elements are rewritten first, so repeat until stable.
    for _ in 0..8 {
        let mut next = SPAN_RE.replace_all(&current, "$1").into_owned();
        next = CODE_RE.replace_all(&next, "`$1`").into_owned();
        next = STRIKE_RE
            .replace_all(&next, |caps: &Captures| wrap("~~", &caps[1]))
            .into_owned();
        next = ITALIC_RE
            .replace_all(&next, |caps: &Captures| wrap("_", &caps[1]))
            .into_owned();
        next = BOLD_RE
            .replace_all(&next, |caps: &Captures| wrap("**", &caps[1]))
            .into_owned();
        next = LINK_RE.replace_all(&next, convert_link).into_owned();
        next = IMG_RE.replace_all(&next, convert_image).into_owned();
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Wraps `inner` in `marker`, keeping surrounding whitespace outside.
fn wrap(marker: &str, inner: &str) -> String {
    let trimmed = inner.trim();
    if trimmed.is_empty() {
        return inner.to_string();
    }
    let leading = if inner.starts_with(char::is_whitespace) { " " } else { "" };
    let trailing = if inner.ends_with(char::is_whitespace) { " " } else { "" };
    format!("{leading}{marker}{trimmed}{marker}{trailing}")
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    ATTR_RE.captures_iter(attrs).find_map(|caps| {
        if caps[1].eq_ignore_ascii_case(name) {
            caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str())
        } else {
            None
        }
    })
}

fn convert_link(caps: &Captures) -> String {
    let text = &caps[2];
    let Some(href) = attribute(&caps[1], "href") else {
        return text.to_string();
    };
    match attribute(&caps[1], "title") {
        Some(title) if !title.is_empty() => format!("[{text}]({href} \"{title}\")"),
        _ => format!("[{text}]({href})"),
    }
}

fn convert_image(caps: &Captures) -> String {
    let attrs = &caps[1];
    let src = attribute(attrs, "src").unwrap_or_default();
    let alt = attribute(attrs, "alt").unwrap_or_default();
    format!("![{alt}]({src})")
}

fn plain_text(html: &str) -> String {
    let stripped = TAG_RE.replace_all(html, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn convert_table(inner: &str) -> String {
    let mut rows: Vec<(bool, Vec<String>)> = Vec::new();
    for row in ROW_RE.captures_iter(inner) {
        let mut is_header = false;
        let mut cells = Vec::new();
        for cell in CELL_RE.captures_iter(&row[1]) {
            is_header |= &cell[1] == "h";
            cells.push(plain_text(&cell[2]).replace('|', "\\|"));
        }
        if !cells.is_empty() {
            rows.push((is_header, cells));
        }
    }
    let Some(columns) = rows.iter().map(|(_, cells)| cells.len()).max() else {
        return String::new();
    };

    let render = |cells: &[String]| {
        let mut padded: Vec<String> = cells.to_vec();
        padded.resize(columns, String::new());
        format!("| {} |", padded.join(" | "))
    };

    let mut lines = Vec::new();
    let body = if rows.first().is_some_and(|(header, _)| *header) {
        lines.push(render(&rows[0].1));
        &rows[1..]
    } else {
        lines.push(format!("|{}", "     |".repeat(columns)));
        &rows[..]
    };
    lines.push(format!("|{}", " --- |".repeat(columns)));
    lines.extend(body.iter().map(|(_, cells)| render(cells)));
    format!("\n\n{}\n\n", lines.join("\n"))
}

fn convert_list(inner: &str, ordered: bool) -> String {
    let items: Vec<String> = LI_RE
        .captures_iter(inner)
        .enumerate()
        .map(|(index, caps)| {
            let text = plain_text(&caps[1]);
            if ordered {
                format!("{}. {text}", index + 1)
            } else {
                format!("- {text}")
            }
        })
        .collect();
    format!("\n\n{}\n\n", items.join("\n"))
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

fn normalize_lines(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let line = if line.starts_with('|') {
            line.to_string()
        } else {
            SPACES_RE.replace_all(line, " ").into_owned()
        };
        if line.is_empty() && lines.last().is_none_or(|prev| prev.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Renders local markdown as the HTML accepted by remote messages.
/// Covers inline emphasis, code, links and paragraphs.
pub fn convert_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");

    let mut html = MD_CODE_RE.replace_all(&escaped, "<code>$1</code>").into_owned();
    html = MD_BOLD_RE.replace_all(&html, "<strong>$1</strong>").into_owned();
    html = MD_STRIKE_RE.replace_all(&html, "<s>$1</s>").into_owned();
    html = MD_ITALIC_RE.replace_all(&html, "<em>$1</em>").into_owned();
    html = MD_LINK_RE
        .replace_all(&html, r#"<a href="$2">$1</a>"#)
        .into_owned();

    PARAGRAPH_RE
        .split(html.trim())
        .filter(|paragraph| !paragraph.trim().is_empty())
        .map(|paragraph| format!("<p>{}</p>", paragraph.trim().replace('\n', "<br>")))
        .collect()
}

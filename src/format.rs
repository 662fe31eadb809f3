//! Markdown-to-Telegram-HTML conversion and tool status formatting.
//!
//! Telegram accepts only a handful of tags (`<b>`, `<i>`, `<code>`, `<pre>`,
//! `<a>`, `<blockquote>`). The converter walks the input line by line with a
//! small block state machine (fences, quotes) and renders inline spans with a
//! cursor, escaping plain text as it is emitted so code contents survive
//! byte-identical inside their span.

use std::path::{Component, Path};

/// Escape HTML-sensitive characters. Runs exactly once per piece of text, at
/// the point it is emitted into the output.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        push_escaped(&mut out, ch);
    }
    out
}

fn push_escaped(out: &mut String, ch: char) {
    match ch {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        other => out.push(other),
    }
}

/// Convert a markdown subset to Telegram-compatible HTML.
pub fn markdown_to_html(input: &str) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let mut fence_body: Option<String> = None;
    let mut quote_lines: Vec<String> = Vec::new();

    for raw in input.lines() {
        let line = raw.trim_end_matches('\r');

        // Fenced code: accumulate raw lines until the closing fence.
        if let Some(body) = fence_body.as_mut() {
            if line.trim_start().starts_with("```") {
                blocks.push(format!("<pre>{}</pre>", escape_html(body)));
                fence_body = None;
            } else {
                body.push_str(line);
                body.push('\n');
            }
            continue;
        }
        if line.trim_start().starts_with("```") {
            fence_body = Some(String::new());
            continue;
        }

        // Quote runs flush as one <blockquote> at the first non-quote line.
        if line == ">" {
            quote_lines.push(String::new());
            continue;
        }
        if let Some(rest) = line.strip_prefix("> ") {
            quote_lines.push(render_inline(rest));
            continue;
        }
        if !quote_lines.is_empty() {
            blocks.push(format!("<blockquote>{}</blockquote>", quote_lines.join("\n")));
            quote_lines.clear();
        }

        let trimmed = line.trim();
        if trimmed.len() >= 3 && trimmed.chars().all(|c| c == '-' || c == '*') {
            continue; // horizontal rule
        }

        if let Some(rest) = header_text(line) {
            blocks.push(format!("<b>{}</b>", render_inline(rest)));
            continue;
        }

        if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            blocks.push(format!("• {}", render_inline(rest)));
            continue;
        }

        blocks.push(render_inline(line));
    }

    // Input ending inside an open construct still renders what it has.
    if let Some(body) = fence_body {
        blocks.push(format!("<pre>{}</pre>", escape_html(&body)));
    }
    if !quote_lines.is_empty() {
        blocks.push(format!("<blockquote>{}</blockquote>", quote_lines.join("\n")));
    }

    // Assemble, capping blank runs at a single empty line.
    let mut out = String::new();
    let mut prev_blank = false;
    for block in blocks {
        let blank = block.is_empty();
        if blank && prev_blank {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&block);
        prev_blank = blank;
    }
    out
}

/// `# heading` through `###### heading` → the heading text.
fn header_text(line: &str) -> Option<&str> {
    let stripped = line.trim_start_matches('#');
    let hashes = line.len() - stripped.len();
    if (1..=6).contains(&hashes) {
        stripped.strip_prefix(' ')
    } else {
        None
    }
}

/// Render one line's inline spans: code, links, bold, italic.
///
/// The cursor tries each span opener at the current position; anything that
/// fails to close on the same line falls through as literal text.
fn render_inline(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i];

        if ch == '`' {
            if let Some(end) = scan_for(&chars, i + 1, '`') {
                out.push_str("<code>");
                out.push_str(&escape_html(&chars[i + 1..end].iter().collect::<String>()));
                out.push_str("</code>");
                i = end + 1;
                continue;
            }
        }

        if ch == '[' {
            if let Some((label, url, after)) = parse_link(&chars, i) {
                out.push_str("<a href=\"");
                out.push_str(&escape_html(&url));
                out.push_str("\">");
                out.push_str(&render_inline(&label));
                out.push_str("</a>");
                i = after;
                continue;
            }
        }

        if ch == '*' || ch == '_' {
            let doubled = chars.get(i + 1) == Some(&ch);
            let (tag, width) = match (ch, doubled) {
                (_, true) => ("b", 2),
                ('*', false) => ("b", 1),
                _ => ("i", 1),
            };
            if let Some(end) = scan_for_delim(&chars, i + width, ch, width) {
                let span: String = chars[i + width..end].iter().collect();
                out.push_str(&format!("<{tag}>{}</{tag}>", render_inline(&span)));
                i = end + width;
                continue;
            }
        }

        push_escaped(&mut out, ch);
        i += 1;
    }

    out
}

fn scan_for(chars: &[char], from: usize, target: char) -> Option<usize> {
    (from..chars.len()).find(|&j| chars[j] == target)
}

/// Find a closing emphasis delimiter of the given width, rejecting positions
/// that belong to a wider delimiter run.
fn scan_for_delim(chars: &[char], from: usize, delim: char, width: usize) -> Option<usize> {
    let mut j = from;
    while j < chars.len() {
        if chars[j] != delim {
            j += 1;
            continue;
        }
        let mut run = 1;
        while chars.get(j + run) == Some(&delim) {
            run += 1;
        }
        if run == width && (width != 1 || chars.get(j.wrapping_sub(1)) != Some(&delim)) {
            return Some(j);
        }
        j += run;
    }
    None
}

/// `[label](url)` starting at `open`. Returns the pieces and the index just
/// past the closing parenthesis.
fn parse_link(chars: &[char], open: usize) -> Option<(String, String, usize)> {
    let close = scan_for(chars, open + 1, ']')?;
    if chars.get(close + 1) != Some(&'(') {
        return None;
    }
    let end = scan_for(chars, close + 2, ')')?;
    if close == open + 1 || end == close + 2 {
        return None; // empty label or url
    }
    let label = chars[open + 1..close].iter().collect();
    let url = chars[close + 2..end].iter().collect();
    Some((label, url, end + 1))
}

/// Split text into chunks of at most `max_len` characters, preferring line
/// boundaries so split messages stay readable.
pub fn split_text(s: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut out = Vec::new();
    let mut cur = String::new();

    for line in s.split_inclusive('\n') {
        if cur.len() + line.len() > max_len && !cur.is_empty() {
            out.push(std::mem::take(&mut cur));
        }
        if line.len() > max_len {
            // A single oversized line gets hard-wrapped.
            let mut rest = line;
            while rest.len() > max_len {
                let cut = floor_char_boundary(rest, max_len);
                out.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            cur.push_str(rest);
            continue;
        }
        cur.push_str(line);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx.max(1)
}

pub fn truncate_with_ellipsis(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let cut = floor_char_boundary(s, max_len);
    format!("{}...", &s[..cut])
}

// ---- Tool status lines ----

/// Last two path components, for compact display.
fn compact_path(path: &str) -> String {
    let names: Vec<&str> = Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .collect();

    match names.as_slice() {
        [] => "file".to_string(),
        [only] => (*only).to_string(),
        [.., dir, name] => format!("{dir}/{name}"),
    }
}

fn one_line(text: &str, max_len: usize) -> String {
    let cleaned = text.replace('\n', " ").trim().to_string();
    truncate_with_ellipsis(&cleaned, max_len)
}

/// Human-readable one-liner for a tool invocation, HTML-safe.
pub fn tool_status(tool_name: &str, tool_input: &serde_json::Value) -> String {
    fn mono(text: &str) -> String {
        format!("<code>{}</code>", escape_html(text))
    }

    let get = |k: &str| tool_input.get(k).and_then(|v| v.as_str()).unwrap_or("");

    match tool_name {
        "Read" => {
            let file_path = get("file_path");
            let lower = file_path.to_lowercase();
            let image_exts = [".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg"];
            if image_exts.iter().any(|ext| lower.ends_with(ext)) {
                return "👀 Viewing image".to_string();
            }
            format!("📖 Reading {}", mono(&compact_path(file_path)))
        }
        "Write" => format!("📝 Writing {}", mono(&compact_path(get("file_path")))),
        "Edit" => format!("✏️ Editing {}", mono(&compact_path(get("file_path")))),
        "Bash" => {
            let desc = get("description");
            if !desc.is_empty() {
                return format!("▶️ {}", escape_html(desc));
            }
            format!("▶️ {}", mono(&one_line(get("command"), 50)))
        }
        "Grep" => {
            let pattern = get("pattern");
            let path = get("path");
            if path.is_empty() {
                format!("🔎 Searching {}", mono(&one_line(pattern, 40)))
            } else {
                format!(
                    "🔎 Searching {} in {}",
                    mono(&one_line(pattern, 30)),
                    mono(&compact_path(path))
                )
            }
        }
        "Glob" => format!("🔍 Finding {}", mono(&one_line(get("pattern"), 50))),
        "WebSearch" => format!("🔍 Searching: {}", escape_html(&one_line(get("query"), 50))),
        "WebFetch" => format!("🌐 Fetching {}", mono(&one_line(get("url"), 50))),
        "Task" => {
            let desc = get("description");
            if desc.is_empty() {
                "🎯 Running agent task".to_string()
            } else {
                format!("🎯 Agent: {}", escape_html(desc))
            }
        }
        "TodoWrite" => "📋 Updating task list".to_string(),
        other => format!("🔧 {}", escape_html(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x&y">"#),
            "&lt;a href=&quot;x&amp;y&quot;&gt;"
        );
    }

    #[test]
    fn test_code_block_contents_untouched() {
        let md = "hi\n```js\nconst x = '<b>';\n```\nbye";
        let html = markdown_to_html(md);
        assert!(html.contains("<pre>const x = '&lt;b&gt;';\n</pre>"));
        assert!(!html.contains("<b>"));
    }

    #[test]
    fn test_unclosed_fence_still_renders() {
        let html = markdown_to_html("start\n```\ndangling");
        assert!(html.contains("<pre>dangling\n</pre>"));
    }

    #[test]
    fn test_inline_code_preserved() {
        let html = markdown_to_html("use `a < b` here");
        assert!(html.contains("<code>a &lt; b</code>"));
    }

    #[test]
    fn test_only_allowed_tags_emitted() {
        let md = "# Title\n**bold** _it_ `c`\n> quoted\n[x](https://e.com)\n- item\n\n```\npre\n```";
        let html = markdown_to_html(md);

        let tag_re = Regex::new(r"</?([a-z]+)").unwrap();
        for cap in tag_re.captures_iter(&html) {
            let tag = &cap[1];
            assert!(
                matches!(tag, "b" | "i" | "code" | "pre" | "a" | "blockquote"),
                "unexpected tag: {tag} in {html}"
            );
        }
    }

    #[test]
    fn test_emphasis_variants() {
        assert_eq!(render_inline("**strong**"), "<b>strong</b>");
        assert_eq!(render_inline("__strong__"), "<b>strong</b>");
        assert_eq!(render_inline("*also bold*"), "<b>also bold</b>");
        assert_eq!(render_inline("_italic_"), "<i>italic</i>");
        // Unmatched delimiters stay literal.
        assert_eq!(render_inline("2 * 3 = 6"), "2 * 3 = 6");
        assert_eq!(render_inline("a_b"), "a_b");
        assert_eq!(render_inline("lone *star"), "lone *star");
    }

    #[test]
    fn test_bullets_and_headers() {
        let html = markdown_to_html("# Head\n- one\n* two");
        assert!(html.contains("<b>Head</b>"));
        assert!(html.contains("• one"));
        assert!(html.contains("• two"));
    }

    #[test]
    fn test_blockquote_multiline() {
        let html = markdown_to_html("> hello\n> world\nok");
        assert!(html.contains("<blockquote>hello\nworld</blockquote>"));
        assert!(html.contains("ok"));
    }

    #[test]
    fn test_links() {
        assert_eq!(
            markdown_to_html("[x](https://example.com)"),
            r#"<a href="https://example.com">x</a>"#
        );
        // Bare brackets without a URL part stay literal.
        assert_eq!(markdown_to_html("see [1] below"), "see [1] below");
    }

    #[test]
    fn test_blank_runs_collapse() {
        let html = markdown_to_html("a\n\n\n\nb");
        assert_eq!(html, "a\n\nb");
    }

    #[test]
    fn test_split_text_bounds_and_reassembly() {
        let input = "line one\nline two\nline three\n".repeat(40);
        let chunks = split_text(&input, 100);
        assert!(chunks.iter().all(|c| c.len() <= 100));
        assert_eq!(chunks.concat(), input);
    }

    #[test]
    fn test_split_text_hard_wraps_long_line() {
        let input = "x".repeat(250);
        let chunks = split_text(&input, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), input);
    }

    #[test]
    fn test_compact_path() {
        assert_eq!(compact_path("/home/u/project/src/main.rs"), "src/main.rs");
        assert_eq!(compact_path("single.txt"), "single.txt");
        assert_eq!(compact_path(""), "file");
    }

    #[test]
    fn test_tool_status_variants() {
        let v = serde_json::json!({"file_path": "/tmp/photo_1.png"});
        assert_eq!(tool_status("Read", &v), "👀 Viewing image");

        let v = serde_json::json!({"file_path": "/home/u/project/src/main.rs"});
        assert!(tool_status("Write", &v).contains("src/main.rs"));

        let v = serde_json::json!({"command": "echo <hi>"});
        assert!(tool_status("Bash", &v).contains("&lt;hi&gt;"));
    }
}

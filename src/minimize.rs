//! Content minimization transforms.
//!
//! Each transform is independently toggleable through [`MinimizeOptions`] and
//! [`minimize`] always applies the enabled ones in the same order:
//!
//! 1. generated-file notice
//! 2. diff markers inside fenced code blocks
//! 3. admonition blocks (`> [!LEGACY]`, `> [!NOTE]`, `> [!DETAILS]`)
//! 4. playground links
//! 5. lone `prettier-ignore` markers
//! 6. HTML comments
//! 7. whitespace collapse
//! 8. trim
//!
//! Whitespace collapse destroys the line structure the earlier transforms
//! depend on, so it must stay near the end.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static GENERATED_NOTICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:<!--[ \t]*)?NOTE: do not edit this file, it is generated\b.*(?:\r?\n|$)")
        .unwrap()
});

static PLAYGROUND_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(/playground[^)]*\)").unwrap());

static HTML_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Placeholder that replaces playground link targets.
pub const PLAYGROUND_PLACEHOLDER: &str = "PLAYGROUND_LINK";

/// Every recognized minimization option, with its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinimizeOptions {
    pub remove_generated_notice: bool,
    pub remove_diff_markers: bool,
    pub remove_legacy: bool,
    pub remove_note_blocks: bool,
    pub remove_details_blocks: bool,
    pub replace_playground_links: bool,
    pub remove_prettier_ignore: bool,
    pub remove_html_comments: bool,
    pub normalize_whitespace: bool,
    pub trim: bool,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self {
            remove_generated_notice: true,
            remove_diff_markers: true,
            remove_legacy: false,
            remove_note_blocks: false,
            remove_details_blocks: false,
            replace_playground_links: false,
            remove_prettier_ignore: true,
            remove_html_comments: false,
            normalize_whitespace: false,
            trim: true,
        }
    }
}

impl MinimizeOptions {
    /// Every transform off. Content passes through untouched.
    pub fn none() -> Self {
        Self {
            remove_generated_notice: false,
            remove_diff_markers: false,
            remove_legacy: false,
            remove_note_blocks: false,
            remove_details_blocks: false,
            replace_playground_links: false,
            remove_prettier_ignore: false,
            remove_html_comments: false,
            normalize_whitespace: false,
            trim: false,
        }
    }

    fn admonition_tags(&self) -> Vec<&'static str> {
        let mut tags = Vec::new();
        if self.remove_legacy {
            tags.push("LEGACY");
        }
        if self.remove_note_blocks {
            tags.push("NOTE");
        }
        if self.remove_details_blocks {
            tags.push("DETAILS");
        }
        tags
    }
}

/// Apply every enabled transform, in the fixed order.
pub fn minimize(content: &str, options: &MinimizeOptions) -> String {
    let mut out = content.to_string();

    if options.remove_generated_notice {
        out = remove_generated_notice(&out);
    }
    if options.remove_diff_markers {
        out = remove_diff_markers(&out);
    }
    let tags = options.admonition_tags();
    if !tags.is_empty() {
        out = remove_admonitions(&out, &tags);
    }
    if options.replace_playground_links {
        out = replace_playground_links(&out);
    }
    if options.remove_prettier_ignore {
        out = remove_prettier_ignore(&out);
    }
    if options.remove_html_comments {
        out = remove_html_comments(&out);
    }
    if options.normalize_whitespace {
        out = normalize_whitespace(&out);
    }
    if options.trim {
        out = out.trim().to_string();
    }

    out
}

/// Drop the "do not edit, generated" banner line.
pub fn remove_generated_notice(content: &str) -> String {
    GENERATED_NOTICE.replace_all(content, "").into_owned()
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

/// Strip `+++` / `---` diff markers, but only inside fenced code blocks.
/// Markdown outside fences (front matter, horizontal rules) is left alone.
pub fn remove_diff_markers(content: &str) -> String {
    let mut in_fence = false;
    let mut out = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        if is_fence(line) {
            in_fence = !in_fence;
            out.push_str(line);
            continue;
        }
        if in_fence {
            out.push_str(&line.replace("+++", "").replace("---", ""));
        } else {
            out.push_str(line);
        }
    }

    out
}

fn admonition_tag(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('>')?.trim_start();
    let rest = rest.strip_prefix("[!")?;
    let end = rest.find(']')?;
    Some(&rest[..end])
}

/// Remove `> [!TAG]` quote blocks, including every continuation line of the
/// quote, for the given tags (case-insensitive).
pub fn remove_admonitions(content: &str, tags: &[&str]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut skipping = false;

    for line in content.split_inclusive('\n') {
        if let Some(tag) = admonition_tag(line) {
            if tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                skipping = true;
                continue;
            }
        }
        if skipping {
            if line.trim_start().starts_with('>') {
                continue;
            }
            skipping = false;
        }
        out.push_str(line);
    }

    out
}

/// `[text](/playground/...)` → `[text](PLAYGROUND_LINK)`.
pub fn replace_playground_links(content: &str) -> String {
    PLAYGROUND_LINK
        .replace_all(content, format!("[$1]({})", PLAYGROUND_PLACEHOLDER).as_str())
        .into_owned()
}

fn is_prettier_ignore(line: &str) -> bool {
    matches!(
        line.trim(),
        "<!-- prettier-ignore -->" | "// prettier-ignore" | "/* prettier-ignore */"
    )
}

/// Drop lines consisting only of a formatter-suppression marker.
pub fn remove_prettier_ignore(content: &str) -> String {
    content
        .split_inclusive('\n')
        .filter(|line| !is_prettier_ignore(line))
        .collect()
}

/// Remove HTML comments, including multi-line ones. Runs to a fixpoint so
/// that a comment exposed by removing a nested one is removed too.
pub fn remove_html_comments(content: &str) -> String {
    let mut current = content.to_string();
    loop {
        let next = HTML_COMMENT.replace_all(&current, "").into_owned();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Collapse every whitespace run (newlines included) to one space.
pub fn normalize_whitespace(content: &str) -> String {
    WHITESPACE.replace_all(content, " ").into_owned()
}

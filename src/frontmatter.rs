//! YAML front matter and title extraction for markdown documents.

/// Split a document into its parsed front matter (as a JSON object) and the
/// remaining body. Documents without front matter, or with front matter that
/// does not parse as a YAML mapping, yield an empty object and the full text.
pub fn parse(content: &str) -> (serde_json::Value, &str) {
    let empty = serde_json::json!({});

    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (empty, content);
    };

    let Some((yaml, body)) = split_closing_fence(rest) else {
        return (empty, content);
    };

    match serde_yaml::from_str::<serde_yaml::Value>(yaml) {
        Ok(value @ serde_yaml::Value::Mapping(_)) => match serde_json::to_value(value) {
            Ok(json) => (json, body),
            Err(_) => (empty, body),
        },
        _ => (empty, body),
    }
}

fn split_closing_fence(rest: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let body = &rest[offset + line.len()..];
            return Some((&rest[..offset], body));
        }
        offset += line.len();
    }
    None
}

/// Title: front matter `title`, else first `# ` heading, else the file stem.
pub fn title(metadata: &serde_json::Value, body: &str, path: &str) -> String {
    if let Some(t) = metadata.get("title").and_then(|t| t.as_str()) {
        let t = t.trim();
        if !t.is_empty() {
            return t.to_string();
        }
    }

    for line in body.lines() {
        if let Some(h) = line.strip_prefix("# ") {
            let h = h.trim();
            if !h.is_empty() {
                return h.to_string();
            }
        }
    }

    let file = path.rsplit('/').next().unwrap_or(path);
    file.split('.').next().unwrap_or(file).to_string()
}

//! On-disk note format: optional front matter followed by the document.
//!
//! ```text
//! ---
//! id: 6f1c...
//! created: 2024-05-01T10:00:00+00:00
//! updated: 2024-05-02T09:30:00+00:00
//! wiki: true
//! pub: true
//! ---
//!
//! # Body
//! ```
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use log::{trace, warn};

use crate::{Document, Note, NoteId};

const DELIMITER: &str = "---";
const KEYS: [&str; 5] = ["id", "created", "updated", "wiki", "pub"];

/// Metadata stored at the top of a note file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontMatter {
    pub id: Option<NoteId>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub wiki: bool,
    pub is_pub: bool,
}

/// Splits `text` into front matter and body. Text without a closed front
/// matter block is all body, and so is a `---` block holding anything but
/// known `key: value` lines.
pub fn split_front_matter(text: &str) -> (FrontMatter, &str) {
    let mut lines = text.split_inclusive('\n');
    match lines.next() {
        Some(first) if first.trim_end() == DELIMITER => {}
        _ => return (FrontMatter::default(), text),
    }

    let mut front = FrontMatter::default();
    let mut keys = 0;
    let mut offset = text.find('\n').map(|i| i + 1).unwrap_or(text.len());
    for line in lines {
        offset += line.len();
        let line = line.trim_end();
        if line == DELIMITER {
            if keys == 0 {
                break;
            }
            let body = text[offset..].trim_start_matches(['\r', '\n']);
            return (front, body);
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            trace!("not front matter: {:?}", line);
            break;
        };
        let key = key.trim();
        if !KEYS.contains(&key) {
            trace!("not front matter: unknown key {}", key);
            break;
        }
        keys += 1;
        let value = value.trim();
        match key {
            "id" if !value.is_empty() => front.id = Some(value.to_string()),
            "created" => front.created = parse_time(value),
            "updated" => front.updated = parse_time(value),
            "wiki" => front.wiki = value == "true",
            "pub" => front.is_pub = value == "true",
            _ => {}
        }
    }

    (FrontMatter::default(), text)
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(time) => Some(time.with_timezone(&Utc)),
        Err(e) => {
            warn!("Ignoring malformed timestamp '{}': {}", value, e);
            None
        }
    }
}

/// Title of the note stored at `path`: the file stem.
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Builds a note from a file's text. Never fails: a missing id gets a fresh
/// one, which is written back on the next save.
pub fn parse_note_file(path: &Path, text: &str) -> Note {
    let (front, body) = split_front_matter(text);
    let mut note = Note::new(title_from_path(path), Document::parse(body));
    if let Some(id) = front.id {
        note.id = id;
    }
    if let Some(created) = front.created {
        note.created_at = created;
        note.updated_at = created;
    }
    if let Some(updated) = front.updated {
        note.updated_at = updated.max(note.created_at);
    }
    note.is_wiki = front.wiki;
    note.is_pub = front.is_pub;
    note.file_path = Some(path.to_path_buf());
    note
}

/// Renders a note to file text, stamping `updated`.
pub fn serialize_note_file(note: &Note, updated: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(&format!("id: {}\n", note.id));
    out.push_str(&format!("created: {}\n", note.created_at.to_rfc3339()));
    out.push_str(&format!("updated: {}\n", updated.to_rfc3339()));
    if note.is_wiki {
        out.push_str("wiki: true\n");
    }
    if note.is_pub {
        out.push_str("pub: true\n");
    }
    out.push_str(DELIMITER);
    out.push_str("\n\n");
    out.push_str(&note.content.serialize());
    out
}

/// Whether `path` has one of the note `extensions` (case-insensitive).
pub fn is_note_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

/// Whether any component of `path` below `root` starts with a dot.
pub fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with('.')))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::TimeZone;

    use super::*;
    use crate::{BlockKind, Inline};

    #[test]
    fn parses_front_matter_and_body() {
        let text = "---\nid: abc\ncreated: 2024-05-01T10:00:00+00:00\nupdated: 2024-05-02T10:00:00Z\nwiki: true\n---\n\n# Hello ^h\n";
        let note = parse_note_file(Path::new("/n/2024-05-01.md"), text);
        assert_eq!(note.id, "abc");
        assert_eq!(note.title, "2024-05-01");
        assert!(note.is_daily);
        assert!(note.is_wiki);
        assert!(!note.is_pub);
        assert_eq!(
            note.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            note.updated_at,
            Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap()
        );
        assert_eq!(note.content.blocks[0].kind, BlockKind::Heading { level: 1 });
        assert_eq!(note.file_path, Some(PathBuf::from("/n/2024-05-01.md")));
    }

    #[test]
    fn files_without_front_matter_get_fresh_ids() {
        let a = parse_note_file(Path::new("a.md"), "plain text\n");
        let b = parse_note_file(Path::new("a.md"), "plain text\n");
        assert_ne!(a.id, b.id);
        assert_eq!(a.content.blocks[0].content, vec![Inline::text("plain text")]);
    }

    #[test]
    fn unclosed_front_matter_is_body() {
        let (front, body) = split_front_matter("---\nid: x\nno end");
        assert_eq!(front, FrontMatter::default());
        assert_eq!(body, "---\nid: x\nno end");
    }

    #[test]
    fn dash_fenced_prose_is_not_front_matter() {
        let text = "---\n\nIntro paragraph the user wrote.\n\n---\n\nRest of note\n";
        let (front, body) = split_front_matter(text);
        assert_eq!(front, FrontMatter::default());
        assert_eq!(body, text);
        let note = parse_note_file(Path::new("/n/a.md"), text);
        assert!(note.content.plain_text().contains("Intro paragraph the user wrote."));
        assert!(note.content.plain_text().contains("Rest of note"));

        let (_, body) = split_front_matter("---\ntitle: Other tool\n---\nbody\n");
        assert!(body.starts_with("---\ntitle"));
        let (_, body) = split_front_matter("---\n---\nbody\n");
        assert!(body.starts_with("---\n---"));

        let (front, body) = split_front_matter("---\nid: x\n\npub: true\n---\nbody\n");
        assert_eq!(front.id.as_deref(), Some("x"));
        assert!(front.is_pub);
        assert_eq!(body, "body\n");
    }

    #[test]
    fn serialize_then_parse_keeps_identity() {
        let mut note = parse_note_file(Path::new("/n/T.md"), "text ^b1\n\n- [ ] task ^b2\n");
        note.is_pub = true;
        let stamp = note.created_at + chrono::Duration::days(1);
        let text = serialize_note_file(&note, stamp);

        let again = parse_note_file(Path::new("/n/T.md"), &text);
        assert_eq!(again.id, note.id);
        assert_eq!(again.updated_at, stamp);
        assert!(again.is_pub);
        assert_eq!(again.content, note.content);
    }

    #[test]
    fn eligibility_and_hidden_entries() {
        let exts = vec!["md".to_string(), "txt".to_string()];
        assert!(is_note_file(Path::new("a/b.MD"), &exts));
        assert!(!is_note_file(Path::new("a/b.png"), &exts));
        assert!(!is_note_file(Path::new("a/README"), &exts));

        let root = Path::new("/n");
        assert!(is_hidden(root, Path::new("/n/.git/config.md")));
        assert!(is_hidden(root, Path::new("/n/.trash")));
        assert!(!is_hidden(root, Path::new("/n/dir/a.md")));
    }
}

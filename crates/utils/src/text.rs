use uuid::Uuid;

/// First 8 hex chars of the simple (hyphenless) uuid form. Used for branch
/// and container names derived from task ids.
pub fn short_id(u: &Uuid) -> String {
    let full = u.simple().to_string();
    full.chars().take(8).collect()
}

/// Per-task git branch, shared by every worktree of the task.
pub fn task_branch(u: &Uuid) -> String {
    format!("task/{}", short_id(u))
}

/// Longest prefix of `content` that fits in `max_len` bytes without
/// splitting a character. Used wherever agent text is clamped for error
/// detail, commit subjects, and event payloads.
pub fn truncate_to_char_boundary(content: &str, max_len: usize) -> &str {
    if content.len() <= max_len {
        return content;
    }
    let mut cut = max_len;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    &content[..cut]
}

/// First line of `content`, truncated to `max_len` bytes on a char boundary.
pub fn first_line_truncated(content: &str, max_len: usize) -> &str {
    let line = content.lines().next().unwrap_or("");
    truncate_to_char_boundary(line.trim(), max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_is_eight_hex_chars() {
        let id = Uuid::new_v4();
        let short = short_id(&id);
        assert_eq!(short.len(), 8);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.simple().to_string().starts_with(&short));
    }

    #[test]
    fn test_truncate_to_char_boundary() {
        assert_eq!(truncate_to_char_boundary("rebase the branch", 6), "rebase");
        assert_eq!(truncate_to_char_boundary("short", 64), "short");
        assert_eq!(truncate_to_char_boundary("", 0), "");

        // "ü" and "ß" are two bytes each; a cut landing inside either
        // backs up to the previous boundary instead of panicking.
        assert_eq!(truncate_to_char_boundary("Grüße", 3), "Gr");
        assert_eq!(truncate_to_char_boundary("Grüße", 4), "Grü");
        assert_eq!(truncate_to_char_boundary("Grüße", 5), "Grü");
    }

    #[test]
    fn test_first_line_truncated_shapes_commit_fallbacks() {
        let prompt = "Add retry backoff to the sync loop\n\nDetails: see issue #42";
        assert_eq!(
            first_line_truncated(prompt, 72),
            "Add retry backoff to the sync loop"
        );

        let rambling = format!("{} and then some", "fix ".repeat(30));
        let subject = first_line_truncated(&rambling, 72);
        assert_eq!(subject.len(), 72);

        assert_eq!(first_line_truncated("", 72), "");
        assert_eq!(first_line_truncated("  padded prompt  \nrest", 72), "padded prompt");
    }
}

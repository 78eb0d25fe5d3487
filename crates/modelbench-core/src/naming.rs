//! Deterministic names derived from run and model identifiers.

use crate::BenchmarkKind;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};

const MAX_SLUG_LEN: usize = 48;
const RUN_ID_SUFFIX_LEN: usize = 6;
const RUN_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Filesystem- and ref-safe slug for a model id.
///
/// Lowercased, separators mapped to `-`, anything outside `[a-z0-9._-]`
/// dropped, then suffixed with a short hash of the raw id so that ids which
/// sanitize to the same text still get distinct slugs.
pub fn model_slug(model_id: &str) -> String {
    let mut slug = String::with_capacity(model_id.len());
    for ch in model_id.chars().flat_map(char::to_lowercase) {
        let mapped = match ch {
            '/' | '\\' | ':' | '@' => Some('-'),
            c if c.is_whitespace() => Some('-'),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => Some(c),
            _ => None,
        };
        if let Some(c) = mapped {
            // git refs reject `..`; repeated dashes are just noise
            if matches!(c, '-' | '.') && slug.ends_with(c) {
                continue;
            }
            slug.push(c);
        }
    }
    let mut slug = slug.trim_matches(|c| c == '-' || c == '.').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches(['-', '.']).to_string();
    }
    let hash = short_hash(model_id);
    if slug.is_empty() {
        format!("model-{hash}")
    } else {
        format!("{slug}-{hash}")
    }
}

pub fn worktree_name(run_id: &str, model_id: &str) -> String {
    format!("{run_id}-{}", model_slug(model_id))
}

pub fn branch_name(prefix: &str, run_id: &str, model_id: &str) -> String {
    format!("{prefix}/{run_id}/{}", model_slug(model_id))
}

/// File stem for a model's result document: the id with every character
/// outside `[A-Za-z0-9._-]` replaced by `_`, plus a short hash of the raw id
/// so ids that sanitize alike still get distinct files.
pub fn model_file_stem(model_id: &str) -> String {
    let stem: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let hash = short_hash(model_id);
    match stem.trim_matches('.') {
        "" => format!("model_{hash}"),
        _ => format!("{stem}_{hash}"),
    }
}

/// `bench-{prefix}-{unix millis}-{6 random [a-z0-9]}`.
pub fn generate_run_id(kind: BenchmarkKind) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..RUN_ID_SUFFIX_LEN)
        .map(|_| RUN_ID_CHARSET[rng.gen_range(0..RUN_ID_CHARSET.len())] as char)
        .collect();
    format!(
        "bench-{}-{}-{suffix}",
        kind.id_prefix(),
        Utc::now().timestamp_millis()
    )
}

fn short_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    format!("{digest:x}")[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn slug_strips_separators_and_lowercases() {
        let slug = model_slug("OpenRouter:Anthropic/Claude 3.5 Sonnet!");
        assert!(slug.starts_with("openrouter-anthropic-claude-3.5-sonnet-"));
        assert_eq!(slug.len(), "openrouter-anthropic-claude-3.5-sonnet-".len() + 8);
    }

    #[test]
    fn slugs_differ_for_ids_that_sanitize_alike() {
        assert_ne!(model_slug("openai/gpt-4o"), model_slug("openai:gpt-4o"));
    }

    #[test]
    fn slug_of_symbols_only_is_still_usable() {
        let slug = model_slug("%%%");
        assert!(slug.starts_with("model-"));
    }

    #[test]
    fn names_embed_run_id() {
        let name = worktree_name("bench-task-1-abc123", "anthropic:claude-sonnet-4");
        assert!(name.starts_with("bench-task-1-abc123-anthropic-claude-sonnet-4-"));
        let branch = branch_name("bench", "bench-task-1-abc123", "anthropic:claude-sonnet-4");
        assert!(branch.starts_with("bench/bench-task-1-abc123/anthropic-claude-sonnet-4-"));
    }

    #[test]
    fn file_stem_replaces_unsafe_characters() {
        assert!(model_file_stem("anthropic:claude-3.5").starts_with("anthropic_claude-3.5_"));
        assert!(model_file_stem("a/b c").starts_with("a_b_c_"));
        assert!(model_file_stem("..").starts_with("model_"));
        assert_eq!(model_file_stem("a:b"), model_file_stem("a:b"));
    }

    #[test]
    fn file_stems_differ_for_ids_that_sanitize_alike() {
        assert_ne!(model_file_stem("a:b_c"), model_file_stem("a_b:c"));
        assert_ne!(model_file_stem("x/y"), model_file_stem("x y"));
    }

    #[test]
    fn run_ids_have_expected_shape() {
        let id = generate_run_id(BenchmarkKind::Workflow);
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "bench");
        assert_eq!(parts[1], "wf");
        assert!(parts[2].parse::<i64>().is_ok());
        assert_eq!(parts[3].len(), 6);
        assert!(parts[3].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    proptest! {
        #[test]
        fn slug_is_deterministic_and_ref_safe(id in ".{0,80}") {
            let a = model_slug(&id);
            let b = model_slug(&id);
            prop_assert_eq!(&a, &b);
            prop_assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')));
            prop_assert!(!a.starts_with('-'));
            prop_assert!(!a.contains(".."));
        }

        #[test]
        fn worktree_names_are_unique_per_model(run in "[a-z0-9-]{1,20}", a in ".{1,30}", b in ".{1,30}") {
            prop_assume!(a != b);
            prop_assert_ne!(worktree_name(&run, &a), worktree_name(&run, &b));
        }

        #[test]
        fn file_stems_are_unique_and_path_safe(a in ".{0,40}", b in ".{0,40}") {
            prop_assume!(a != b);
            let stem = model_file_stem(&a);
            prop_assert!(stem.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')));
            prop_assert_ne!(stem, model_file_stem(&b));
        }
    }
}

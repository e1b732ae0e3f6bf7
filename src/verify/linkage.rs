//! Pull request to issue linkage.
//!
//! A PR is linked to an issue by a closing keyword followed by a reference,
//! the same convention GitHub uses to auto-close issues:
//!
//! ```text
//! Fixes #7
//! closes acme/widgets#7, #9
//! Resolves: https://github.com/acme/widgets/issues/7
//! ```
//!
//! References to other repositories are ignored. Bare `#7` mentions without
//! a keyword are not links.

use crate::types::RepoId;

const KEYWORDS: &[&str] = &[
    "close", "closes", "closed", "fix", "fixes", "fixed", "resolve", "resolves", "resolved",
];

/// Issue numbers linked from `text`, in order of appearance, without duplicates.
pub fn linked_issues(text: &str, repo: &RepoId) -> Vec<u64> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut issues = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if !is_keyword(tokens[i]) {
            i += 1;
            continue;
        }
        i += 1;
        // A keyword may be followed by a list: `#1, #2 and #3`.
        while i < tokens.len() {
            let token = tokens[i];
            if token.eq_ignore_ascii_case("and") {
                i += 1;
                continue;
            }
            let Some(number) = parse_reference(token, repo) else {
                break;
            };
            if !issues.contains(&number) {
                issues.push(number);
            }
            i += 1;
            let continues = token.ends_with(',')
                || tokens.get(i).is_some_and(|t| t.eq_ignore_ascii_case("and"));
            if !continues {
                break;
            }
        }
    }
    issues
}

fn is_keyword(token: &str) -> bool {
    let word = token.trim_end_matches(':').to_ascii_lowercase();
    KEYWORDS.contains(&word.as_str())
}

/// Parses `#N`, `owner/repo#N` or an issue URL pointing into `repo`.
fn parse_reference(token: &str, repo: &RepoId) -> Option<u64> {
    let token = token.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | '(' | ')' | '[' | ']'));

    if let Some(number) = token.strip_prefix('#') {
        return parse_number(number);
    }

    if let Some(path) = token
        .strip_prefix("https://github.com/")
        .or_else(|| token.strip_prefix("http://github.com/"))
    {
        let mut parts = path.split('/');
        let (owner, name, kind, number) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if kind != "issues" || !same_repo(owner, name, repo) {
            return None;
        }
        return parse_number(number.split(['#', '?']).next()?);
    }

    let (full_name, number) = token.split_once('#')?;
    let (owner, name) = full_name.split_once('/')?;
    if !same_repo(owner, name, repo) {
        return None;
    }
    parse_number(number)
}

fn same_repo(owner: &str, name: &str, repo: &RepoId) -> bool {
    owner.eq_ignore_ascii_case(&repo.owner) && name.eq_ignore_ascii_case(&repo.repo)
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn repo() -> RepoId {
        RepoId::new("acme", "widgets")
    }

    #[test]
    fn keyword_and_hash() {
        assert_eq!(linked_issues("Fixes #7", &repo()), vec![7]);
        assert_eq!(linked_issues("this closes #12.", &repo()), vec![12]);
        assert_eq!(linked_issues("Resolves: #3", &repo()), vec![3]);
    }

    #[test]
    fn bare_mentions_are_not_links() {
        assert!(linked_issues("See #7 for context", &repo()).is_empty());
        assert!(linked_issues("fixes the bug", &repo()).is_empty());
    }

    #[test]
    fn qualified_references_must_match_repo() {
        assert_eq!(linked_issues("fixes acme/widgets#7", &repo()), vec![7]);
        assert_eq!(linked_issues("fixes ACME/Widgets#7", &repo()), vec![7]);
        assert!(linked_issues("fixes other/repo#7", &repo()).is_empty());
    }

    #[test]
    fn issue_urls() {
        assert_eq!(
            linked_issues("Closes https://github.com/acme/widgets/issues/7", &repo()),
            vec![7]
        );
        assert!(linked_issues("Closes https://github.com/acme/widgets/pull/7", &repo()).is_empty());
        let foreign = "Closes https://github.com/evil/widgets/issues/7";
        assert!(linked_issues(foreign, &repo()).is_empty());
    }

    #[test]
    fn lists_and_duplicates() {
        assert_eq!(linked_issues("Fixes #1, #2 and #3", &repo()), vec![1, 2, 3]);
        assert_eq!(linked_issues("fix #4\n\nAlso fixes #4", &repo()), vec![4]);
        assert_eq!(linked_issues("fixes #5 #6", &repo()), vec![5]);
    }

    #[test]
    fn garbage_numbers_are_ignored() {
        assert!(linked_issues("fixes #0", &repo()).is_empty());
        assert!(linked_issues("fixes #abc", &repo()).is_empty());
        assert!(linked_issues("fixes #", &repo()).is_empty());
    }

    proptest! {
        #[test]
        fn every_keyword_links(keyword in prop::sample::select(KEYWORDS), n in 1u64..100_000) {
            let text = format!("{} #{n}", keyword.to_uppercase());
            prop_assert_eq!(linked_issues(&text, &repo()), vec![n]);
        }

        #[test]
        fn arbitrary_text_never_panics(text: String) {
            let _ = linked_issues(&text, &repo());
        }
    }
}

//! Filesystem-safe node names.
//!
//! Every component that turns a node name into a path component goes
//! through [`sanitize`]; a second implementation anywhere else would let
//! lookups silently miss.

/// Characters that may not appear in a node directory or file name.
pub const UNSAFE_CHARS: [char; 3] = ['*', '$', '/'];

/// Replacement for every unsafe character.
pub const REPLACEMENT: char = '_';

/// Returns the on-disk directory name for a node.
#[must_use]
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if UNSAFE_CHARS.contains(&c) { REPLACEMENT } else { c })
        .collect()
}

/// Returns true if `dir_name` is usable as a single path component.
#[must_use]
pub fn is_usable_dir_name(dir_name: &str) -> bool {
    !dir_name.is_empty() && dir_name != "." && dir_name != ".." && !dir_name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("db1.example.com", "db1.example.com" ; "plain name untouched")]
    #[test_case("*.example.com", "_.example.com" ; "wildcard")]
    #[test_case("a$b", "a_b" ; "dollar")]
    #[test_case("rack/1/node", "rack_1_node" ; "slashes")]
    #[test_case("*$/", "___" ; "all unsafe")]
    fn sanitize_cases(input: &str, expected: &str) {
        assert_eq!(sanitize(input), expected);
    }

    #[test_case("", false ; "empty")]
    #[test_case(".", false ; "dot")]
    #[test_case("..", false ; "dotdot")]
    #[test_case("node-1", true ; "normal")]
    fn usable_dir_names(dir_name: &str, expected: bool) {
        assert_eq!(is_usable_dir_name(dir_name), expected);
    }

    proptest! {
        #[test]
        fn sanitized_names_never_contain_unsafe_chars(name in ".*") {
            let safe = sanitize(&name);
            prop_assert!(!safe.contains(UNSAFE_CHARS));
            prop_assert_eq!(safe.chars().count(), name.chars().count());
        }

        #[test]
        fn sanitize_is_idempotent(name in ".*") {
            let once = sanitize(&name);
            prop_assert_eq!(sanitize(&once), once);
        }
    }
}

use crate::error::{Error, Result};

/// Literal that replaces path separators in flattened destination names.
pub const FLAT_SEPARATOR: &str = "___";

/// Flatten an archive path into a single file name.
///
/// Both separators are accepted. `.` components are dropped, `..` removes the
/// previous component and never climbs above the archive root, and roots and
/// drive prefixes are discarded. The remaining components are joined with
/// [`FLAT_SEPARATOR`].
pub fn flatten_entry_name(name: &str) -> Result<String> {
    if name.contains('\0') {
        return Err(Error::InvalidPath);
    }

    let mut parts: Vec<&str> = Vec::new();
    for (index, component) in name.split(['/', '\\']).enumerate() {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c if index == 0 && is_drive_prefix(c) => {}
            c => parts.push(c),
        }
    }

    if parts.is_empty() {
        return Err(Error::EmptyPath {
            path: name.to_string(),
        });
    }
    Ok(parts.join(FLAT_SEPARATOR))
}

fn is_drive_prefix(component: &str) -> bool {
    let bytes = component.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nested_paths_are_joined() {
        assert_eq!(
            flatten_entry_name("acme-export/events/login.json").unwrap(),
            "acme-export___events___login.json"
        );
        assert_eq!(
            flatten_entry_name("acme-export\\devices\\list.json").unwrap(),
            "acme-export___devices___list.json"
        );
    }

    #[test]
    fn traversal_and_roots_are_neutralised() {
        assert_eq!(flatten_entry_name("/etc/passwd").unwrap(), "etc___passwd");
        assert_eq!(flatten_entry_name("C:\\Users\\x.txt").unwrap(), "Users___x.txt");
        assert_eq!(flatten_entry_name("../../a/./b/../c").unwrap(), "a___c");
    }

    #[test]
    fn empty_and_null_names_are_rejected() {
        assert!(matches!(flatten_entry_name(""), Err(Error::EmptyPath { .. })));
        assert!(matches!(flatten_entry_name("a/.."), Err(Error::EmptyPath { .. })));
        assert!(matches!(flatten_entry_name("a\0b"), Err(Error::InvalidPath)));
    }

    proptest! {
        #[test]
        fn flattened_names_are_single_components(name in "[a-zA-Z0-9./\\\\_-]{0,40}") {
            if let Ok(flat) = flatten_entry_name(&name) {
                prop_assert!(!flat.is_empty());
                prop_assert!(!flat.contains('/'));
                prop_assert!(!flat.contains('\\'));
                prop_assert!(flat != "." && flat != "..");
            }
        }

        #[test]
        fn plain_components_round_trip(parts in prop::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            let flat = flatten_entry_name(&parts.join("/")).unwrap();
            prop_assert_eq!(flat, parts.join(FLAT_SEPARATOR));
        }
    }
}

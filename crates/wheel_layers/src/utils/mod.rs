mod read_and_seek;

pub use read_and_seek::ReadAndSeek;

/// Convert a relative [`std::path::Path`] into the slash-separated archive
/// path used as a [`crate::Vfs`] key.
pub(crate) fn path_to_key(path: &std::path::Path) -> String {
    let mut key = String::new();
    for component in path.components() {
        if let std::path::Component::Normal(part) = component {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(&part.to_string_lossy());
        }
    }
    key
}

/// Compute `path` relative to `base`, where both are slash-separated archive
/// paths. Shared leading segments are stripped and the remaining depth of
/// `base` is climbed with `..` segments.
///
/// `bin/six-cli` relative to `lib/python3.9/site-packages` is
/// `../../../bin/six-cli`.
pub(crate) fn relative_to(path: &str, base: &str) -> String {
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let base_segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();

    let common = path_segments
        .iter()
        .zip(base_segments.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut segments: Vec<&str> = Vec::new();
    for _ in common..base_segments.len() {
        segments.push("..");
    }
    segments.extend(&path_segments[common..]);
    segments.join("/")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(
                "lib/python3.9/site-packages/foo/__init__.py",
                "lib/python3.9/site-packages"
            ),
            "foo/__init__.py"
        );
        assert_eq!(
            relative_to("lib/marker.txt", "lib/python3.9/site-packages"),
            "../../marker.txt"
        );
        assert_eq!(
            relative_to("bin/foo_launcher", "lib/python3.9/site-packages"),
            "../../../bin/foo_launcher"
        );
    }

    #[test]
    fn test_path_to_key() {
        assert_eq!(
            path_to_key(std::path::Path::new("lib/python3.9/site-packages")),
            "lib/python3.9/site-packages"
        );
        assert_eq!(path_to_key(std::path::Path::new("")), "");
    }
}

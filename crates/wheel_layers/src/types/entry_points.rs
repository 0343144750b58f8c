//! This module contains code to parse entry points from a python package.

use regex::Regex;
use std::{collections::HashSet, sync::OnceLock};
use thiserror::Error;

/// Entry points are a mechanism for an installed python package to declare
/// functions that can be called from the command line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryPoint {
    /// The name of the script that will be created
    pub script_name: String,

    /// The module in which the entry point is defined
    pub module: String,

    /// The function in the module that is the entry point
    pub function: Option<String>,
}

/// An error that might be raised when parsing [`EntryPoint`]s.
#[derive(Debug, Error)]
pub enum ParseEntryPointError {
    /// The entry point is not in the expected format.
    #[error("entry point is not in the expected format")]
    InvalidFormat,
}

impl EntryPoint {
    /// Parses an entry point from a `name = module:function [extras]` value.
    ///
    /// Returns `None` when the entry point requires an extra that is not in
    /// the activated set. Passing `None` for `extras` disables the filtering
    /// entirely.
    pub fn parse(
        script_name: String,
        entry_point: &str,
        extras: Option<&HashSet<String>>,
    ) -> Result<Option<Self>, ParseEntryPointError> {
        static ENTRY_POINT_REGEX: OnceLock<Regex> = OnceLock::new();
        let entry_point_regex = ENTRY_POINT_REGEX.get_or_init(|| {
            Regex::new(r"^(?P<module>[\w\d_\-.]+)(:(?P<function>[\w\d_\-.]+))?(?:\s+\[(?P<extras>(?:[^,]+,?\s*)+)])?$").unwrap()
        });

        let captures = entry_point_regex
            .captures(entry_point)
            .ok_or(ParseEntryPointError::InvalidFormat)?;

        // Check the extras part
        if let Some(script_extras) = captures.name("extras") {
            if let Some(extras) = extras {
                for extra in script_extras.as_str().split(',') {
                    if !extras.contains(extra.trim()) {
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(Self {
            script_name,
            module: captures
                .name("module")
                .expect("if the regex has captures this group must be here")
                .as_str()
                .to_string(),
            function: captures.name("function").map(|s| s.as_str().to_string()),
        }))
    }

    /// Returns the script that launches the entry-point, including the
    /// shebang line. `shebang` is the interpreter command line without the
    /// leading `#!`.
    pub fn launch_script(&self, shebang: &str) -> String {
        let (module, import_name) = match self.function.as_deref() {
            Some(func) => (self.module.as_str(), func),
            None => match self.module.split_once('.') {
                Some((module, func)) => (module, func),
                None => (self.module.as_str(), self.module.as_str()),
            },
        };

        format!(
            r##"#!{shebang}
# -*- coding: utf-8 -*-
import re
import sys
from {module} import {import_name}
if __name__ == '__main__':
    sys.argv[0] = re.sub(r'(-script\.pyw|\.exe)?$', '', sys.argv[0])
    sys.exit({import_name}())
"##,
            shebang = shebang,
            module = module,
            import_name = import_name
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_module_and_function() {
        let entry_point =
            EntryPoint::parse(String::from("blackd"), "blackd:patched_main", None)
                .unwrap()
                .unwrap();
        assert_eq!(entry_point.script_name, "blackd");
        assert_eq!(entry_point.module, "blackd");
        assert_eq!(entry_point.function.as_deref(), Some("patched_main"));
    }

    #[test]
    fn parse_object_reference() {
        let entry_point =
            EntryPoint::parse(String::from("some"), "some_module.object_ref", None)
                .unwrap()
                .unwrap();
        assert_eq!(entry_point.module, "some_module.object_ref");
        assert_eq!(entry_point.function.as_deref(), None);
    }

    #[test]
    fn extras_filter_entry_points() {
        // No activated extras set: extras are ignored.
        assert!(
            EntryPoint::parse(String::from("blackd"), "blackd:patched_main [d]", None)
                .unwrap()
                .is_some()
        );

        // Empty activated set: the entry point is filtered out.
        assert!(EntryPoint::parse(
            String::from("blackd"),
            "blackd:patched_main [d]",
            Some(&HashSet::new())
        )
        .unwrap()
        .is_none());

        // Matching activated set: the entry point is kept.
        assert!(EntryPoint::parse(
            String::from("blackd"),
            "blackd:patched_main [d]",
            Some(&HashSet::from_iter([String::from("d")]))
        )
        .unwrap()
        .is_some());
    }

    #[test]
    fn launch_script_contents() {
        let entry_point = EntryPoint::parse(String::from("click"), "click.cli:main", None)
            .unwrap()
            .unwrap();
        let script = entry_point.launch_script("/usr/bin/python3");
        insta::assert_snapshot!(script, @r###"
        #!/usr/bin/python3
        # -*- coding: utf-8 -*-
        import re
        import sys
        from click.cli import main
        if __name__ == '__main__':
            sys.argv[0] = re.sub(r'(-script\.pyw|\.exe)?$', '', sys.argv[0])
            sys.exit(main())
        "###);
    }
}

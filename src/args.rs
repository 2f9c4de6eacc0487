//! Command-line argument helpers shared by the runner adapters.
//!
//! User supplied runner arguments (`pytest_args`, `nosetest_args`, ...) are
//! passed through mostly verbatim, but discovery must strip flags that make
//! no sense for a collect-only pass. Options are matched exactly, in their
//! `--opt=value` form, or with a trailing `*` wildcard (`--cover-*`).

/// Removes the listed options from `args`.
///
/// Options in `with_values` take a value: when given as a separate
/// argument (`--opt value`) the value is dropped too. Options in
/// `without_values` are flags; a wildcard entry that matches an argument
/// without an inline value also drops the argument that follows.
///
/// ```
/// use pyrunner::args::filter_arguments;
///
/// let args = ["-x", "--rootdir", "src", "--log-level", "INFO", "-k=fast", "tests"];
/// let kept = filter_arguments(&args, &["--rootdir", "-k"], &["-x", "--log-*"]);
/// assert_eq!(kept, vec!["tests"]);
/// ```
pub fn filter_arguments<S: AsRef<str>>(
    args: &[S],
    with_values: &[&str],
    without_values: &[&str],
) -> Vec<String> {
    let wildcard_match = |arg: &str| {
        without_values
            .iter()
            .filter_map(|option| option.strip_suffix('*'))
            .any(|prefix| arg.starts_with(prefix))
    };

    let mut kept = Vec::with_capacity(args.len());
    let mut skip_next = false;
    for arg in args {
        let arg = arg.as_ref();
        if skip_next {
            skip_next = false;
            continue;
        }
        if without_values.contains(&arg) {
            continue;
        }
        if with_values.contains(&arg) {
            skip_next = true;
            continue;
        }
        if with_values
            .iter()
            .any(|option| arg.strip_prefix(option).is_some_and(|rest| rest.starts_with('=')))
        {
            continue;
        }
        if wildcard_match(arg) {
            skip_next = !arg.contains('=');
            continue;
        }
        kept.push(arg.to_string());
    }
    kept
}

/// Returns every value given for `option`, in `--opt=value` or
/// `--opt value` form.
pub fn get_option_values<S: AsRef<str>>(args: &[S], option: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut take_next = false;
    for arg in args {
        let arg = arg.as_ref();
        if take_next {
            values.push(arg.to_string());
            take_next = false;
            continue;
        }
        if let Some(value) = arg.strip_prefix(option).and_then(|rest| rest.strip_prefix('=')) {
            values.push(value.to_string());
        } else if arg == option {
            take_next = true;
        }
    }
    values
}

/// Returns `true` if `option` appears, bare or with an inline value.
pub fn has_option<S: AsRef<str>>(args: &[S], option: &str) -> bool {
    args.iter().any(|arg| {
        let arg = arg.as_ref();
        arg == option || arg.strip_prefix(option).is_some_and(|rest| rest.starts_with('='))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_exact_flags() {
        let args = ["-v", "--pdb", "tests/", "-q"];
        assert_eq!(filter_arguments(&args, &[], &["-v", "-q", "--pdb"]), vec!["tests/"]);
    }

    #[test]
    fn test_filter_wildcard_with_inline_value() {
        let args = ["--cover-package=foo", "--with-id", "--verbosity=2"];
        assert_eq!(
            filter_arguments(&args, &[], &["--cover-*", "--verbosity*"]),
            vec!["--with-id"]
        );
    }

    #[test]
    fn test_option_values() {
        let args = ["-s", "src", "--start-directory=lib", "-p", "*_test.py"];
        assert_eq!(get_option_values(&args, "-s"), vec!["src"]);
        assert_eq!(get_option_values(&args, "--start-directory"), vec!["lib"]);
        assert_eq!(get_option_values(&args, "-p"), vec!["*_test.py"]);
        assert!(get_option_values(&args, "--pattern").is_empty());
    }

    #[test]
    fn test_has_option() {
        let args = ["--xunit-file=out.xml", "--failed"];
        assert!(has_option(&args, "--xunit-file"));
        assert!(has_option(&args, "--failed"));
        assert!(!has_option(&args, "--fail"));
    }
}

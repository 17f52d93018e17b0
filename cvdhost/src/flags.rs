//! Command-line compatibility for the daemons.
//!
//! Orchestrators pass gflags-style single-dash flags (`-tcp_port=5555`).
//! They are rewritten to the double-dash form before `clap` parses them.

use std::ffi::OsString;

/// Rewrite `-name=value` and `-name` to `--name=value` and `--name`.
///
/// The program name, `--` separated tail, negative numbers and short
/// single-letter flags are left alone.
pub fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (index, arg) in args.into_iter().enumerate() {
        if index == 0 || passthrough {
            out.push(arg);
            continue;
        }
        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        if text == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        out.push(match rewrite(text) {
            Some(rewritten) => OsString::from(rewritten),
            None => arg,
        });
    }
    out
}

fn rewrite(arg: &str) -> Option<String> {
    let rest = arg.strip_prefix('-')?;
    if rest.starts_with('-') {
        return None;
    }
    let name = rest.split('=').next().unwrap_or(rest);
    let long_name = name.len() > 1
        && name
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic());
    long_name.then(|| format!("--{}", rest))
}

/// Normalized `std::env::args_os()`.
pub fn args() -> Vec<OsString> {
    normalize_args(std::env::args_os())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Vec<String> {
        normalize_args(args.iter().map(OsString::from))
            .into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_single_dash_flags_rewritten() {
        assert_eq!(
            run(&["proxy", "-server=tcp", "-tcp_port=5555", "-daemon"]),
            vec!["proxy", "--server=tcp", "--tcp_port=5555", "--daemon"]
        );
    }

    #[test]
    fn test_other_arguments_untouched() {
        assert_eq!(
            run(&["proxy", "--vsock_port=1", "-v", "-1", "value", "--", "-raw=1"]),
            vec!["proxy", "--vsock_port=1", "-v", "-1", "value", "--", "-raw=1"]
        );
    }
}

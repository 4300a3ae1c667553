//! Environment variable names and caller-environment helpers

/// Session override read on the host
pub const ISO_SESSION: &str = "ISO_SESSION";
/// Host directory used instead of cache volumes
pub const ISO_CACHE_DIR: &str = "ISO_CACHE_DIR";
/// Path of the helper binary mounted into containers
pub const ISO_HELPER: &str = "ISO_HELPER";

// Supervisor protocol, set inside the container
pub const ISO_WORKDIR: &str = "ISO_WORKDIR";
pub const ISO_UID: &str = "ISO_UID";
pub const ISO_GID: &str = "ISO_GID";
pub const ISO_SERVICES: &str = "ISO_SERVICES";
pub const ISO_PEER_NAME: &str = "ISO_PEER_NAME";
pub const ISO_PEER_HOSTNAME: &str = "ISO_PEER_HOSTNAME";

pub const TERM: &str = "TERM";
pub const DEBUG: &str = "DEBUG";

/// Map terminal types the container images rarely ship terminfo for
pub fn normalize_term(term: &str) -> String {
    match term {
        "xterm-ghostty" => "xterm-256color".to_string(),
        other => other.to_string(),
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split leading `KEY=VALUE` words from a command line.
///
/// Returns `(assignments, command)`. Scanning stops at the first word that is not
/// an assignment with a valid variable name.
pub fn split_env_assignments(args: &[String]) -> (Vec<String>, Vec<String>) {
    let split = args
        .iter()
        .position(|arg| match arg.split_once('=') {
            Some((name, _)) => !is_env_name(name),
            None => true,
        })
        .unwrap_or(args.len());

    (args[..split].to_vec(), args[split..].to_vec())
}

/// Parse a `KEY=VALUE` word
pub fn parse_assignment(word: &str) -> Option<(&str, &str)> {
    word.split_once('=').filter(|(name, _)| is_env_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &[&str]) -> Vec<String> {
        s.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_split_env_assignments() {
        let (env, cmd) = split_env_assignments(&words(&["A=1", "B_2=x=y", "make", "C=3"]));
        assert_eq!(env, words(&["A=1", "B_2=x=y"]));
        assert_eq!(cmd, words(&["make", "C=3"]));

        let (env, cmd) = split_env_assignments(&words(&["1A=1", "ls"]));
        assert!(env.is_empty());
        assert_eq!(cmd, words(&["1A=1", "ls"]));

        let (env, cmd) = split_env_assignments(&words(&["ONLY=1"]));
        assert_eq!(env, words(&["ONLY=1"]));
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("FOO=bar=baz"), Some(("FOO", "bar=baz")));
        assert_eq!(parse_assignment("=x"), None);
        assert_eq!(parse_assignment("noequals"), None);
    }

    #[test]
    fn test_normalize_term() {
        assert_eq!(normalize_term("xterm-ghostty"), "xterm-256color");
        assert_eq!(normalize_term("screen"), "screen");
    }
}

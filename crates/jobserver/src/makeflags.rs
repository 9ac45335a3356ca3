// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `MAKEFLAGS` handling for job-server forwarding.
//!
//! Incoming `-j` and `--jobserver-auth` options are stripped before fresh
//! values for the forwarded pipe are appended. Stale fd numbers from an
//! outer make would otherwise leak into child processes.

use crate::Fds;

/// Parse `--jobserver-auth=R,W` (or the older `--jobserver-fds`) from a
/// `MAKEFLAGS` value.
pub fn parse_auth(makeflags: &str) -> Option<Fds> {
    for word in makeflags.split_whitespace() {
        let Some(fds) = word
            .strip_prefix("--jobserver-auth=")
            .or_else(|| word.strip_prefix("--jobserver-fds="))
        else {
            continue;
        };
        let Some((read, write)) = fds.split_once(',') else {
            continue;
        };
        if let (Ok(read), Ok(write)) = (read.parse(), write.parse()) {
            return Some(Fds { read, write });
        }
    }
    None
}

/// Remove any `-j<N>` and `--jobserver-auth=` options.
pub fn strip(makeflags: &str) -> String {
    makeflags
        .split_whitespace()
        .filter(|word| {
            !word.starts_with("--jobserver-auth=")
                && !word.starts_with("--jobserver-fds=")
                && !is_jobs_flag(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compose the `MAKEFLAGS` value for a child that takes part in the
/// job-server protocol.
pub fn compose(makeflags: Option<&str>, fds: Fds, jobs: usize) -> String {
    let base = makeflags.map(strip).unwrap_or_default();
    let sep = if base.is_empty() { "" } else { " " };
    format!("{base}{sep}-j{jobs} --jobserver-auth={},{}", fds.read, fds.write)
}

fn is_jobs_flag(word: &str) -> bool {
    word.strip_prefix("-j")
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_auth_variants() {
        let fds = parse_auth("-j4 --jobserver-auth=3,4").unwrap();
        assert_eq!(fds.read, 3);
        assert_eq!(fds.write, 4);

        let fds = parse_auth("--jobserver-fds=7,8 -j").unwrap();
        assert_eq!(fds.read, 7);
        assert_eq!(fds.write, 8);

        assert!(parse_auth("-j4 -k").is_none());
    }

    #[test]
    fn strip_removes_parallelism_options() {
        assert_eq!(strip("-k -j8 --jobserver-auth=3,4 -w"), "-k -w");
        assert_eq!(strip("-j"), "");
        assert_eq!(strip(""), "");
    }

    #[test]
    fn compose_appends_fresh_values() {
        let fds = Fds { read: 10, write: 11 };
        assert_eq!(
            compose(Some("-k -j2 --jobserver-auth=3,4"), fds, 4),
            "-k -j4 --jobserver-auth=10,11"
        );
        assert_eq!(compose(None, fds, 2), "-j2 --jobserver-auth=10,11");
    }
}

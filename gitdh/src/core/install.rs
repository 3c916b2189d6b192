//! Rendering of the files `git-dh install` writes.

use std::fmt::Write as _;

/// Default permissions of an installed post-receive hook.
pub const HOOK_MODE: &str = "755";
/// Default permissions of an installed cron file.
pub const CRON_MODE: &str = "644";
pub const DEFAULT_CRON_INTERVAL: &str = "*/5 * * * *";
pub const DEFAULT_MAILTO: &str = "root";
pub const CRON_DIR: &str = "/etc/cron.d";

/// Quote `s` for a POSIX shell, leaving safe words untouched.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || "@%+=:,./-".contains(c));
    if safe {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Parse an octal permission string such as `755`.
pub fn parse_mode(mode: &str) -> Option<u32> {
    u32::from_str_radix(mode, 8).ok().filter(|m| *m <= 0o7777)
}

/// Hook script feeding every pushed ref of `target` to `git-dh postreceive`.
pub fn render_post_receive_hook(target: &str) -> String {
    format!(
        "#!/bin/sh\n\
         \n\
         configFile={}\n\
         \n\
         while read oldrev newrev refname\n\
         do\n\
         \tgit-dh postreceive \"$configFile\" \"$oldrev\" \"$newrev\" \"$refname\"\n\
         done\n\
         \n\
         exit 0\n",
        shell_quote(target)
    )
}

/// Fields of a `/etc/cron.d` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronEntry {
    pub path: String,
    pub unix_path: String,
    pub mailto: String,
    pub interval: String,
    pub user: String,
    pub targets: Vec<String>,
}

/// Cron file running `git-dh cron` over every target.
pub fn render_cron_file(entry: &CronEntry) -> String {
    let mut command = String::from("git-dh cron");
    for target in &entry.targets {
        let _ = write!(command, " {}", shell_quote(target));
    }
    format!(
        "# {}: Cron Job file for git-dh\n\
         \n\
         PATH={}\n\
         MAILTO={}\n\
         \n\
         {}    {}    {}\n",
        entry.path, entry.unix_path, entry.mailto, entry.interval, entry.user, command
    )
}

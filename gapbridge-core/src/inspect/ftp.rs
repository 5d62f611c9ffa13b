//! FTP control-line policy

use std::collections::HashSet;

use super::Verdict;

/// RFC 959 verbs plus the extensions common clients rely on
/// (RFC 2228, 2389, 2428, 3659).
pub const ALLOWED_COMMANDS: &[&str] = &[
    "USER", "PASS", "ACCT", "CWD", "CDUP", "SMNT", "QUIT", "REIN", "PORT", "PASV",
    "TYPE", "STRU", "MODE", "RETR", "STOR", "STOU", "APPE", "ALLO", "REST", "RNFR",
    "RNTO", "ABOR", "DELE", "RMD", "MKD", "PWD", "LIST", "NLST", "SITE", "SYST",
    "STAT", "HELP", "NOOP", "FEAT", "OPTS", "AUTH", "PBSZ", "PROT", "EPSV", "EPRT",
    "SIZE", "MDTM", "MLSD", "MLST", "XPWD", "XCUP", "XMKD", "XRMD", "XCWD",
];

/// Shell metacharacters that never belong in an FTP argument
pub const INJECTION_TOKENS: &[&str] = &["$(", "`", ";", "&&", "||", "|"];

/// Longest accepted command line, CRLF excluded
pub const MAX_COMMAND_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct FtpCommandPolicy {
    allowed: HashSet<&'static str>,
}

impl Default for FtpCommandPolicy {
    fn default() -> Self {
        Self {
            allowed: ALLOWED_COMMANDS.iter().copied().collect(),
        }
    }
}

impl FtpCommandPolicy {
    /// Check a single control line, with or without its CRLF terminator.
    pub fn check(&self, line: &str) -> Verdict {
        let line = line.strip_suffix("\r\n").or_else(|| line.strip_suffix('\n')).unwrap_or(line);
        let trimmed = line.trim();

        if trimmed.is_empty() {
            return Verdict::Malformed("empty command".to_string());
        }
        if line.len() > MAX_COMMAND_LEN {
            return Verdict::Rejected(format!("command longer than {} bytes", MAX_COMMAND_LEN));
        }
        if line.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
            return Verdict::Rejected("embedded control characters".to_string());
        }

        let verb = trimmed
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        if let Some(token) = INJECTION_TOKENS.iter().find(|t| trimmed.contains(**t)) {
            return Verdict::Rejected(format!("command injection token {:?}", token));
        }
        if !self.allowed.contains(verb.as_str()) {
            return Verdict::Rejected(format!("command {} not permitted", verb));
        }

        Verdict::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelisted_commands() {
        let policy = FtpCommandPolicy::default();
        for line in ["LIST", "USER test\r\n", "retr report.pdf", "PASV", "TYPE I", "CWD /pub/data"] {
            assert_eq!(policy.check(line), Verdict::Accepted, "{}", line);
        }
    }

    #[test]
    fn test_injection_tokens_rejected() {
        let policy = FtpCommandPolicy::default();
        for line in [
            "DELE; rm -rf /",
            "RETR $(id)",
            "RETR `whoami`",
            "STOR a && b",
            "STOR a || b",
            "LIST | nc host 1",
        ] {
            assert!(matches!(policy.check(line), Verdict::Rejected(_)), "{}", line);
        }
    }

    #[test]
    fn test_unknown_and_malformed() {
        let policy = FtpCommandPolicy::default();
        assert!(matches!(policy.check("FOOBAR"), Verdict::Rejected(_)));
        assert!(matches!(policy.check("\r\n"), Verdict::Malformed(_)));
        assert!(matches!(policy.check("USER a\rPASS b"), Verdict::Rejected(_)));
        assert!(matches!(policy.check(&format!("CWD {}", "a".repeat(600))), Verdict::Rejected(_)));
    }
}

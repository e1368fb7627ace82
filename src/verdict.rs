use serde::Serialize;
use std::fmt;

/// Outcome of an SPF evaluation for one (client, sender) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SpfVerdict {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfVerdict {
    /// Only definitive answers are remembered; error outcomes are always
    /// re-evaluated on the next transaction.
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            SpfVerdict::Pass
                | SpfVerdict::Fail
                | SpfVerdict::SoftFail
                | SpfVerdict::Neutral
                | SpfVerdict::None
        )
    }

    /// Fail and SoftFail drive subject tagging and quarantine.
    pub fn is_failing(self) -> bool {
        matches!(self, SpfVerdict::Fail | SpfVerdict::SoftFail)
    }

    /// Keyword used in Authentication-Results headers.
    pub fn keyword(self) -> &'static str {
        match self {
            SpfVerdict::Pass => "pass",
            SpfVerdict::Fail => "fail",
            SpfVerdict::SoftFail => "softfail",
            SpfVerdict::Neutral => "neutral",
            SpfVerdict::None => "none",
            SpfVerdict::TempError => "temperror",
            SpfVerdict::PermError => "permerror",
        }
    }
}

impl fmt::Display for SpfVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpfVerdict::Pass => "Pass",
            SpfVerdict::Fail => "Fail",
            SpfVerdict::SoftFail => "SoftFail",
            SpfVerdict::Neutral => "Neutral",
            SpfVerdict::None => "None",
            SpfVerdict::TempError => "TempError",
            SpfVerdict::PermError => "PermError",
        };
        f.write_str(name)
    }
}

impl From<mail_auth::SpfResult> for SpfVerdict {
    fn from(result: mail_auth::SpfResult) -> Self {
        match result {
            mail_auth::SpfResult::Pass => SpfVerdict::Pass,
            mail_auth::SpfResult::Fail => SpfVerdict::Fail,
            mail_auth::SpfResult::SoftFail => SpfVerdict::SoftFail,
            mail_auth::SpfResult::Neutral => SpfVerdict::Neutral,
            mail_auth::SpfResult::None => SpfVerdict::None,
            mail_auth::SpfResult::TempError => SpfVerdict::TempError,
            mail_auth::SpfResult::PermError => SpfVerdict::PermError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_definitive_verdicts_are_cacheable() {
        for verdict in [
            SpfVerdict::Pass,
            SpfVerdict::Fail,
            SpfVerdict::SoftFail,
            SpfVerdict::Neutral,
            SpfVerdict::None,
        ] {
            assert!(verdict.is_cacheable(), "{verdict} should be cacheable");
        }
        assert!(!SpfVerdict::TempError.is_cacheable());
        assert!(!SpfVerdict::PermError.is_cacheable());
    }

    #[test]
    fn test_failing_verdicts() {
        assert!(SpfVerdict::Fail.is_failing());
        assert!(SpfVerdict::SoftFail.is_failing());
        assert!(!SpfVerdict::Neutral.is_failing());
        assert!(!SpfVerdict::Pass.is_failing());
    }

    #[test]
    fn test_keywords() {
        assert_eq!(SpfVerdict::SoftFail.keyword(), "softfail");
        assert_eq!(SpfVerdict::SoftFail.to_string(), "SoftFail");
        assert_eq!(SpfVerdict::TempError.keyword(), "temperror");
    }
}

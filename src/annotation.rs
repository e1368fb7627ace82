//! Text of the headers and replies the milter produces.

use crate::verdict::SpfVerdict;

pub const AUTH_RESULTS_HEADER: &str = "Authentication-Results";
pub const RECEIVED_SPF_HEADER: &str = "Received-SPF";
pub const ORIGINAL_TO_HEADER: &str = "X-SPF-Original-To";

/// Facts about one evaluated message, shared by every annotation.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation<'a> {
    pub site: &'a str,
    pub verdict: SpfVerdict,
    pub reason: Option<&'a str>,
    pub client: &'a str,
    pub sender: &'a str,
    pub envelope_from: &'a str,
    pub helo: &'a str,
}

/// `<site>; spf=<result> smtp.mailfrom=<sender> smtp.helo=<helo>`
pub fn authentication_results(eval: &Evaluation<'_>) -> String {
    let mut result = eval.verdict.keyword().to_string();
    if let Some(reason) = eval.reason {
        result.push_str(&format!(" ({reason})"));
    }
    format!(
        "{}; spf={} smtp.mailfrom={} smtp.helo={}",
        eval.site, result, eval.sender, eval.helo
    )
}

/// Legacy verbose header, one wording per verdict.
pub fn received_spf(eval: &Evaluation<'_>) -> String {
    let Evaluation {
        site,
        verdict,
        client,
        sender,
        envelope_from,
        helo,
        ..
    } = *eval;
    let comment = match verdict {
        SpfVerdict::Pass => {
            format!("{site}: domain of {sender}\n\tdesignates {client} as permitted sender")
        }
        SpfVerdict::Fail => format!(
            "{site}: domain of {sender}\n\tdoes not designate {client} as permitted sender"
        ),
        SpfVerdict::SoftFail => format!(
            "{site}: transitioning domain of {sender}\n\tdoes not designate {client} as permitted sender"
        ),
        SpfVerdict::Neutral => format!(
            "{site}: {client} is neither permitted\n\tnor denied by domain of {sender}"
        ),
        _ => format!("{site}: domain of {sender}\n\tdoes not designate permitted sender hosts"),
    };
    format!(
        "{verdict} ({comment})\n\treceiver={site}; client-ip={client};\n\tenvelope-from={envelope_from}; helo={helo};"
    )
}

pub fn tagged_subject(tag: &str, subject: Option<&str>) -> String {
    match subject {
        Some(subject) => format!("{tag} {subject}"),
        None => tag.to_string(),
    }
}

/// Expand a reject reason template.
///
/// `%1`, `%2` and `%3` (optionally written printf-style as `%1$s`) stand for
/// the sender, the client address and the site; `%%` is a literal percent.
pub fn format_reject_reason(template: &str, sender: &str, client: &str, site: &str) -> String {
    let mut out = String::with_capacity(template.len() + sender.len() + client.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let value = match chars.peek() {
            Some('1') => sender,
            Some('2') => client,
            Some('3') => site,
            Some('%') => {
                chars.next();
                out.push('%');
                continue;
            }
            _ => {
                out.push('%');
                continue;
            }
        };
        chars.next();
        let mut lookahead = chars.clone();
        if lookahead.next() == Some('$') && lookahead.next() == Some('s') {
            chars = lookahead;
        }
        out.push_str(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluation(verdict: SpfVerdict) -> Evaluation<'static> {
        Evaluation {
            site: "mx.example.net",
            verdict,
            reason: None,
            client: "192.0.2.1",
            sender: "user@example.com",
            envelope_from: "<user@example.com>",
            helo: "mail.example.com",
        }
    }

    #[test]
    fn test_authentication_results() {
        assert_eq!(
            authentication_results(&evaluation(SpfVerdict::SoftFail)),
            "mx.example.net; spf=softfail smtp.mailfrom=user@example.com smtp.helo=mail.example.com"
        );

        let mut eval = evaluation(SpfVerdict::Fail);
        eval.reason = Some("not authorized");
        assert!(authentication_results(&eval).contains("spf=fail (not authorized) "));
    }

    #[test]
    fn test_received_spf_templates() {
        let pass = received_spf(&evaluation(SpfVerdict::Pass));
        assert!(pass.starts_with("Pass (mx.example.net: domain of user@example.com\n\tdesignates 192.0.2.1"));
        assert!(pass.ends_with("envelope-from=<user@example.com>; helo=mail.example.com;"));

        let fail = received_spf(&evaluation(SpfVerdict::Fail));
        assert!(fail.starts_with("Fail ("));
        assert!(fail.contains("does not designate 192.0.2.1 as permitted sender"));

        let softfail = received_spf(&evaluation(SpfVerdict::SoftFail));
        assert!(softfail.contains("transitioning domain of user@example.com"));

        let neutral = received_spf(&evaluation(SpfVerdict::Neutral));
        assert!(neutral.contains("192.0.2.1 is neither permitted\n\tnor denied"));

        let none = received_spf(&evaluation(SpfVerdict::None));
        assert!(none.starts_with("None ("));
        assert!(none.contains("does not designate permitted sender hosts"));

        let temperror = received_spf(&evaluation(SpfVerdict::TempError));
        assert!(temperror.starts_with("TempError ("));
        assert!(temperror.contains("does not designate permitted sender hosts"));
    }

    #[test]
    fn test_tagged_subject() {
        assert_eq!(tagged_subject("[SPF:fail]", Some("Hello")), "[SPF:fail] Hello");
        assert_eq!(tagged_subject("[SPF:fail]", None), "[SPF:fail]");
    }

    #[test]
    fn test_reject_reason_placeholders() {
        assert_eq!(
            format_reject_reason(
                crate::config::DEFAULT_REJECT_REASON,
                "user@example.com",
                "192.0.2.1",
                "mx.example.net"
            ),
            "Message was rejected during SPF policy evaluation. sender:user@example.com client-ip:192.0.2.1"
        );
        assert_eq!(
            format_reject_reason("%3 refused %1 (%2) 100%%", "a@b.c", "10.0.0.1", "mx"),
            "mx refused a@b.c (10.0.0.1) 100%"
        );
        assert_eq!(format_reject_reason("%9 %$ %", "a", "b", "c"), "%9 %$ %");
        assert_eq!(format_reject_reason("%1$x", "a@b.c", "b", "c"), "a@b.c$x");
    }
}

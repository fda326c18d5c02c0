//! Voter identity helpers: e-mail domain extraction and the college-domain
//! eligibility rule shared by the listing and tally paths.

pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_DOMAIN_LEN: usize = 253;

/// Extracts the lowercased domain of an e-mail address. Returns `None` when
/// the address carries no `@` or nothing after the last one.
pub fn email_domain(email: &str) -> Option<String> {
    let trimmed = email.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_EMAIL_LEN {
        return None;
    }

    let (local, domain) = trimmed.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }

    assert!(domain.len() < MAX_EMAIL_LEN, "Domain longer than its address");
    Some(domain.to_ascii_lowercase())
}

/// Canonical form of an allowed-domain entry: trimmed, lowercased, without
/// the leading `@` some upstream records carry. Empty input normalizes to
/// `None` and is dropped by callers.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('@').trim();
    if trimmed.is_empty() || trimmed.len() > MAX_DOMAIN_LEN {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// The one-vote-gate eligibility rule: an empty allowed set admits every
/// authenticated voter; otherwise the voter's domain must be a member,
/// case-insensitively.
pub fn is_eligible(allowed_domains: &[String], voter_email: &str) -> bool {
    if allowed_domains.is_empty() {
        return true;
    }

    let Some(domain) = email_domain(voter_email) else {
        return false;
    };

    allowed_domains
        .iter()
        .filter_map(|entry| normalize_domain(entry))
        .any(|entry| entry == domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction() {
        assert_eq!(
            email_domain("jane@college-a.edu").as_deref(),
            Some("college-a.edu")
        );
        assert_eq!(
            email_domain("Jane@COLLEGE-A.EDU").as_deref(),
            Some("college-a.edu")
        );
        // Quoted locals may embed @; the domain is after the last one.
        assert_eq!(
            email_domain("\"odd@local\"@example.org").as_deref(),
            Some("example.org")
        );
        assert_eq!(email_domain("not-an-email"), None);
        assert_eq!(email_domain("@missing-local.edu"), None);
        assert_eq!(email_domain("trailing@"), None);
        assert_eq!(email_domain("   "), None);
    }

    #[test]
    fn domain_normalization() {
        assert_eq!(
            normalize_domain("@heraldcollege.edu.np").as_deref(),
            Some("heraldcollege.edu.np")
        );
        assert_eq!(normalize_domain("  ICP.EDU.NP  ").as_deref(), Some("icp.edu.np"));
        assert_eq!(normalize_domain("@"), None);
        assert_eq!(normalize_domain(""), None);
    }

    #[test]
    fn eligibility_is_case_insensitive() {
        let allowed = vec!["college-a.edu".to_string()];
        assert!(is_eligible(&allowed, "Jane@COLLEGE-A.EDU"));
        assert!(!is_eligible(&allowed, "jane@college-b.edu"));
    }

    #[test]
    fn empty_allowed_set_admits_everyone() {
        assert!(is_eligible(&[], "anyone@anywhere.example"));
        assert!(is_eligible(&[], "even-this-is-fine"));
    }

    #[test]
    fn legacy_at_prefixed_entries_still_match() {
        let allowed = vec!["@islingtoncollege.edu.np".to_string()];
        assert!(is_eligible(&allowed, "student@islingtoncollege.edu.np"));
        assert!(!is_eligible(&allowed, "student@apexcollege.edu.np"));
    }
}

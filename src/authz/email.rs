use crate::config::AuthorizationConfig;

/// Email address restrictions.
///
/// With neither a whitelist nor domains configured every identity passes.
/// Otherwise the email must be whitelisted or belong to an allowed domain.
#[derive(Debug, Clone, Default)]
pub struct EmailPolicy {
    whitelist: Vec<String>,
    domains: Vec<String>,
}

impl EmailPolicy {
    pub fn new<I, S>(whitelist: I, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            whitelist: whitelist
                .into_iter()
                .map(|e| e.as_ref().trim().to_ascii_lowercase())
                .collect(),
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('@').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &AuthorizationConfig) -> Self {
        Self::new(&config.whitelist, &config.domains)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.whitelist.is_empty() && self.domains.is_empty()
    }

    /// `Err` carries the denial reason.
    pub fn check(&self, email: Option<&str>) -> Result<(), String> {
        if self.is_unrestricted() {
            return Ok(());
        }
        let Some(email) = email.map(str::to_ascii_lowercase) else {
            return Err("identity has no email address".into());
        };

        if self.whitelist.iter().any(|allowed| *allowed == email) {
            return Ok(());
        }
        if let Some((_, domain)) = email.rsplit_once('@')
            && self.domains.iter().any(|allowed| allowed == domain)
        {
            return Ok(());
        }
        Err(format!("email {email} is not allowed"))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[], &[], Some("anyone@anywhere.io"), true)]
    #[case(&[], &[], None, true)]
    #[case(&["boss@corp.com"], &[], Some("Boss@Corp.com"), true)]
    #[case(&["boss@corp.com"], &[], Some("intern@corp.com"), false)]
    #[case(&[], &["corp.com"], Some("intern@corp.com"), true)]
    #[case(&[], &["@corp.com"], Some("intern@corp.com"), true)]
    #[case(&[], &["corp.com"], Some("intern@notcorp.com"), false)]
    #[case(&[], &["corp.com"], Some("intern@sub.corp.com"), false)]
    #[case(&["guest@partner.org"], &["corp.com"], Some("guest@partner.org"), true)]
    #[case(&[], &["corp.com"], None, false)]
    fn test_email_policy(
        #[case] whitelist: &[&str],
        #[case] domains: &[&str],
        #[case] email: Option<&str>,
        #[case] allowed: bool,
    ) {
        let policy = EmailPolicy::new(whitelist, domains);
        assert_eq!(policy.check(email).is_ok(), allowed);
    }
}

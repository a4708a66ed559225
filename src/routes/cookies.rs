//! Session and CSRF cookie construction.

use tower_cookies::{
    Cookie,
    cookie::{SameSite as CookieSameSite, time::Duration as CookieDuration},
};

use crate::config::CookieConfig;

/// Login attempts must finish within this window.
const CSRF_LIFETIME_SECS: i64 = 600;

fn base(config: &CookieConfig, name: String, value: String, host: &str) -> Cookie<'static> {
    let mut builder = Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(config.secure());
    if let Some(domain) = config.domain_for_host(host) {
        builder = builder.domain(domain.to_string());
    }
    builder.build()
}

pub(super) fn session(config: &CookieConfig, host: &str, token: String) -> Cookie<'static> {
    let mut cookie = base(config, config.name.clone(), token, host);
    cookie.set_same_site(CookieSameSite::from(config.same_site));
    cookie.set_max_age(CookieDuration::seconds(config.lifetime().num_seconds()));
    cookie
}

pub(super) fn csrf(config: &CookieConfig, host: &str, value: String) -> Cookie<'static> {
    let mut cookie = base(config, config.csrf_name.clone(), value, host);
    // The provider redirect back is a cross-site navigation; Strict would drop it.
    let same_site = match CookieSameSite::from(config.same_site) {
        CookieSameSite::Strict => CookieSameSite::Lax,
        other => other,
    };
    cookie.set_same_site(same_site);
    cookie.set_max_age(CookieDuration::seconds(CSRF_LIFETIME_SECS));
    cookie
}

/// Cookie matching `name`'s path and domain, for `Cookies::remove`.
pub(super) fn removal(config: &CookieConfig, name: &str, host: &str) -> Cookie<'static> {
    base(config, name.to_string(), String::new(), host)
}

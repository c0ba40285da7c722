//! Configuration objects consumed by the transport layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::{Geolocation, ProxyProfile, Resource, ResourceProfile};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl From<&ProxyProfile> for ProxyConfig {
    fn from(p: &ProxyProfile) -> Self {
        Self {
            server: format!("{}://{}:{}", p.protocol.scheme(), p.host, p.port),
            username: p.username.clone(),
            password: p.password.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrowserContext {
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation>,
    pub timezone: String,
    pub locale: String,
}

impl BrowserContext {
    /// Derive a context from a session's bound resources.
    ///
    /// Session identity settings win over the device's; geolocation follows
    /// the proxy exit when one is bound. Returns `None` without either an
    /// identity or a device.
    pub fn derive(
        identity: Option<&Resource>,
        device: Option<&Resource>,
        proxy: Option<&Resource>,
    ) -> Option<Self> {
        let device_profile = device.and_then(|r| match &r.profile {
            ResourceProfile::Device(d) => Some(d),
            _ => None,
        });
        let identity_profile = identity.and_then(|r| match &r.profile {
            ResourceProfile::SessionIdentity(s) => Some(s),
            _ => None,
        });

        let (user_agent, locale, timezone) = match (identity_profile, device_profile) {
            (Some(s), _) => (s.user_agent.clone(), s.locale.clone(), s.timezone.clone()),
            (None, Some(d)) => (d.user_agent.clone(), d.locale.clone(), d.timezone.clone()),
            (None, None) => return None,
        };

        let languages: Vec<String> = match device_profile {
            Some(d) if !d.languages.is_empty() => d.languages.clone(),
            _ => vec![locale.clone()],
        };

        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), user_agent);
        headers.insert("Accept-Language".to_string(), accept_language(&languages));

        let geolocation = proxy
            .and_then(|r| r.geolocation.clone())
            .or_else(|| device.and_then(|r| r.geolocation.clone()))
            .or_else(|| identity.and_then(|r| r.geolocation.clone()));

        Some(Self {
            headers,
            geolocation,
            timezone,
            locale,
        })
    }
}

/// `["en-US", "en"]` → `"en-US,en;q=0.9"`.
fn accept_language(languages: &[String]) -> String {
    languages
        .iter()
        .enumerate()
        .map(|(i, lang)| {
            if i == 0 {
                lang.clone()
            } else {
                let q = (10 - i.min(9)) as f64 / 10.0;
                format!("{lang};q={q:.1}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Everything the transport layer needs for one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BrowserContext>,
}

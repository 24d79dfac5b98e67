//! The root-domain origin family.
//!
//! Every service lives at `{scheme}://{service}.{root_domain}`; the root
//! origin itself is the homepage app. Anything else is foreign: it may not
//! issue calls, and components may not send requests to it.

use crate::error::SupervisorError;
use crate::types::{Origination, QualifiedPluginId, ServiceId, HOMEPAGE_APP, SUPERVISOR_SERVICE};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginFamily {
    scheme: String,
    root_domain: String,
}

impl OriginFamily {
    pub fn new(scheme: &str, root_domain: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            root_domain: root_domain.to_ascii_lowercase(),
        }
    }

    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    pub fn root_origin(&self) -> String {
        format!("{}://{}", self.scheme, self.root_domain)
    }

    pub fn service_origin(&self, service: &str) -> String {
        format!("{}://{}.{}", self.scheme, service, self.root_domain)
    }

    pub fn supervisor_origin(&self) -> String {
        self.service_origin(SUPERVISOR_SERVICE)
    }

    /// Where the binary of a plugin is served from.
    pub fn plugin_url(&self, id: &QualifiedPluginId) -> String {
        format!("{}/{}.wasm", self.service_origin(id.service.as_str()), id.plugin)
    }

    /// `host[:port]` of a URL, lowercased.
    fn authority(url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        Some(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        })
    }

    /// Checks that `uri` points into the family; used for all egress.
    pub fn check(&self, uri: &str) -> Result<Url, SupervisorError> {
        let url = Url::parse(uri)
            .map_err(|e| SupervisorError::Network(format!("invalid url '{}': {}", uri, e)))?;
        if url.scheme() != self.scheme {
            return Err(SupervisorError::Network(format!(
                "scheme '{}' not allowed, expected '{}'",
                url.scheme(),
                self.scheme
            )));
        }
        let authority = Self::authority(&url)
            .ok_or_else(|| SupervisorError::Network(format!("url '{}' has no host", uri)))?;
        let in_family = authority == self.root_domain
            || authority.ends_with(&format!(".{}", self.root_domain));
        if !in_family {
            return Err(SupervisorError::Network(format!(
                "host '{}' is outside {}",
                authority, self.root_domain
            )));
        }
        Ok(url)
    }

    /// Derives the app of a caller origin.
    pub fn originate(&self, origin: &str) -> Result<Origination, SupervisorError> {
        let foreign =
            || SupervisorError::Validation(format!("origin '{}' is outside {}", origin, self.root_domain));
        let url = Url::parse(origin).map_err(|_| foreign())?;
        if url.scheme() != self.scheme {
            return Err(foreign());
        }
        let authority = Self::authority(&url).ok_or_else(foreign)?;
        let app = if authority == self.root_domain {
            HOMEPAGE_APP.to_string()
        } else {
            let label = authority
                .strip_suffix(&format!(".{}", self.root_domain))
                .ok_or_else(foreign)?;
            ServiceId::parse(label).map_err(|_| foreign())?.to_string()
        };
        Ok(Origination {
            app,
            origin: format!("{}://{}", url.scheme(), authority),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family() -> OriginFamily {
        OriginFamily::new("https", "psibase.test")
    }

    #[test]
    fn originate_maps_subdomains_to_apps() {
        let o = family().originate("https://accounts.psibase.test").unwrap();
        assert_eq!(o.app, "accounts");
        assert_eq!(o.origin, "https://accounts.psibase.test");

        let home = family().originate("https://psibase.test/").unwrap();
        assert_eq!(home.app, HOMEPAGE_APP);
    }

    #[test]
    fn originate_rejects_foreign_origins() {
        for origin in [
            "https://evil.example",
            "http://accounts.psibase.test",
            "https://a.b.psibase.test",
            "https://notpsibase.test",
            "not a url",
        ] {
            assert!(
                matches!(family().originate(origin), Err(SupervisorError::Validation(_))),
                "{origin}"
            );
        }
    }

    #[test]
    fn egress_is_limited_to_the_family() {
        let f = family();
        assert!(f.check("https://psibase.test/common/chainid").is_ok());
        assert!(f.check("https://tokens.psibase.test/api?x=1").is_ok());
        assert!(matches!(
            f.check("https://example.com/"),
            Err(SupervisorError::Network(_))
        ));
        assert!(f.check("https://psibase.test.example.com/").is_err());
        assert!(f.check("http://psibase.test/").is_err());
    }

    #[test]
    fn ports_are_part_of_the_root() {
        let f = OriginFamily::new("http", "psibase.localhost:8080");
        assert_eq!(f.originate("http://x.psibase.localhost:8080").unwrap().app, "x");
        assert!(f.originate("http://x.psibase.localhost").is_err());
        let id = "x:plugin".parse().unwrap();
        assert_eq!(f.plugin_url(&id), "http://x.psibase.localhost:8080/plugin.wasm");
    }
}

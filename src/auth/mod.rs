//! Authentication and ownership
//!
//! Operators authenticate with HTTP Basic credentials checked against a
//! users file. Containers belong to the user who deployed them through
//! their `owner` label.

mod users;

pub use users::{hash_password, UserStore};

use crate::compose::translate::{APP_LABEL, OWNER_LABEL};
use crate::container::ListFilters;
use serde::Serialize;
use std::collections::HashMap;

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Username
    pub username: String,
    /// Sees and manages every container
    pub admin: bool,
    /// May list containers of any application by name
    pub multi_app: bool,
}

impl Identity {
    /// Create an identity
    pub fn new(username: &str, admin: bool, multi_app: bool) -> Self {
        Self {
            username: username.to_string(),
            admin,
            multi_app,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn is_multi_app(&self) -> bool {
        self.multi_app
    }
}

/// Container listing filters for a user
///
/// Multi-app users asking for one application see all of its containers,
/// admins see everything, everyone else sees the containers they own.
pub fn label_filters(identity: &Identity, app: Option<&str>) -> ListFilters {
    match app {
        Some(app) if !app.is_empty() && identity.is_multi_app() => {
            ListFilters::none().label(APP_LABEL, app)
        }
        _ if identity.is_admin() => ListFilters::none(),
        _ => ListFilters::none().label(OWNER_LABEL, &identity.username),
    }
}

/// Whether a user may act on a container with these labels
pub fn can_manage(identity: &Identity, labels: &HashMap<String, String>) -> bool {
    identity.is_admin() || labels.get(OWNER_LABEL) == Some(&identity.username)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_filters() {
        let admin = Identity::new("admin", true, false);
        let guest = Identity::new("guest", false, false);
        let ops = Identity::new("ops", false, true);

        assert_eq!(label_filters(&admin, None), ListFilters::none());
        assert_eq!(
            label_filters(&guest, Some("blog")),
            ListFilters::none().label("owner", "guest")
        );
        assert_eq!(
            label_filters(&ops, Some("blog")),
            ListFilters::none().label("app", "blog")
        );
        assert_eq!(
            label_filters(&ops, Some("")),
            ListFilters::none().label("owner", "ops")
        );
    }

    #[test]
    fn test_can_manage() {
        let labels = HashMap::from([("owner".to_string(), "guest".to_string())]);

        assert!(can_manage(&Identity::new("guest", false, false), &labels));
        assert!(can_manage(&Identity::new("admin", true, false), &labels));
        assert!(!can_manage(&Identity::new("other", false, true), &labels));
        assert!(!can_manage(
            &Identity::new("guest", false, false),
            &HashMap::new()
        ));
    }
}

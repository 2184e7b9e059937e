//! Compose file parser

use super::config::ComposeFile;
use super::naming::{is_valid_name, DEPLOY_SUFFIX};
use crate::error::{DeckhandError, Result};

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Parse and validate a compose file
    pub fn load(content: &str) -> Result<ComposeFile> {
        let compose = Self::parse_str(content)?;
        Self::validate(&compose)?;
        Ok(compose)
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> Result<ComposeFile> {
        serde_yaml::from_str(content)
            .map_err(|e| DeckhandError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Validate compose configuration
    pub fn validate(compose: &ComposeFile) -> Result<()> {
        if compose.services.is_empty() {
            return Err(DeckhandError::ComposeParse(
                "No service declared".to_string(),
            ));
        }

        for (name, service) in &compose.services {
            if !is_valid_name(name) {
                return Err(DeckhandError::ComposeParse(format!(
                    "Invalid service name '{}'",
                    name
                )));
            }

            // Final names are derived by stripping the suffix
            if name.ends_with(DEPLOY_SUFFIX) {
                return Err(DeckhandError::ComposeParse(format!(
                    "Service name '{}' must not end with '{}'",
                    name, DEPLOY_SUFFIX
                )));
            }

            if service.image.trim().is_empty() {
                return Err(DeckhandError::ComposeParse(format!(
                    "Service '{}' must have an 'image' specified",
                    name
                )));
            }

            for link in &service.links {
                let valid = match link.split_once(':') {
                    Some((target, alias)) => !target.is_empty() && !alias.is_empty(),
                    None => !link.is_empty(),
                };
                if !valid {
                    return Err(DeckhandError::ComposeParse(format!(
                        "Service '{}' has an invalid link '{}'",
                        name, link
                    )));
                }
            }
        }

        Ok(())
    }
}

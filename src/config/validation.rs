use super::{AppConfig, ConfigError, VendorEndpointConfig};

/// Validate semantic constraints that serde cannot express.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] with a human-readable message on the
/// first violated constraint.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_vendor("primary", &config.primary)?;
    validate_vendor("secondary", &config.secondary)?;

    if config.server.port == 0 {
        return Err(ConfigError::Validation(
            "server.port must be non-zero".to_string(),
        ));
    }
    if let Some(count) = config.server.tcp_reuse_port_listener_count {
        if count == 0 {
            return Err(ConfigError::Validation(
                "server.tcp_reuse_port_listener_count must be at least 1 when set".to_string(),
            ));
        }
    }

    let mut seen_tokens = rustc_hash::FxHashSet::default();
    for identity in &config.features.client_identities {
        if identity.token.trim().is_empty() || identity.user_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "features.client_identities entries need non-empty token and user_id".to_string(),
            ));
        }
        if !seen_tokens.insert(identity.token.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate client identity token for user '{}'",
                identity.user_id
            )));
        }
    }

    Ok(())
}

fn validate_vendor(name: &str, vendor: &VendorEndpointConfig) -> Result<(), ConfigError> {
    if vendor.base_url.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{name}.base_url must not be empty"
        )));
    }
    url::Url::parse(&vendor.base_url).map_err(|err| {
        ConfigError::Validation(format!("{name}.base_url is not a valid URL: {err}"))
    })?;
    if vendor.models.baseline.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{name}.models.baseline must not be empty"
        )));
    }
    if vendor.max_streams == 0 {
        return Err(ConfigError::Validation(format!(
            "{name}.max_streams must be at least 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn rejects_bad_base_url() {
        let mut config = AppConfig::default();
        config.secondary.base_url = "not a url".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_zero_streams() {
        let mut config = AppConfig::default();
        config.primary.max_streams = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_duplicate_identity_tokens() {
        let mut config = AppConfig::default();
        config.features.client_identities = vec![
            crate::config::ClientIdentity {
                token: "t1".to_string(),
                user_id: "alice".to_string(),
            },
            crate::config::ClientIdentity {
                token: "t1".to_string(),
                user_id: "bob".to_string(),
            },
        ];
        assert!(validate_config(&config).is_err());
    }
}

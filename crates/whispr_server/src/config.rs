use secrecy::SecretString;
use serde::Deserialize;

/// Layered server settings: defaults, then an optional `configuration.yaml`
/// next to the binary, then `APP__*` environment overrides (double
/// underscore is the nesting separator `config` uses for struct fields).
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub bind_address: String,
    pub bind_port: u16,
    pub storage_root: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub auth_secret: SecretString,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::new(raw))
}

impl Settings {
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("bind_address", "127.0.0.1")?
            .set_default("bind_port", 8080)?
            .set_default("storage_root", "./data")?
            .set_default("auth_secret", "change-me")?
            .add_source(config::File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn env_override_takes_precedence_over_defaults() {
        std::env::set_var("APP__BIND_PORT", "9090");
        let settings = Settings::load().unwrap();
        assert_eq!(settings.bind_port, 9090);
        std::env::remove_var("APP__BIND_PORT");
    }

    #[test]
    fn auth_secret_defaults_when_unset() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.auth_secret.expose_secret(), "change-me");
    }
}

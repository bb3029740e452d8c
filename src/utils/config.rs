//! Config string parsing helper macro.

/// Parses an optional TOML config string into a config struct, starting
/// from the struct's `Default` and overriding only the fields present in
/// the string. The field list names every key the struct accepts; any
/// other key in the string is an error.
///
/// Returns `Result<config struct type, QuorumcastError>`.
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+ $(,)?) => {{
        (|| -> Result<$config_type, $crate::QuorumcastError> {
            let mut config = <$config_type>::default();
            if let Some(s) = $config_str {
                let table: ::toml::Table = s.parse()?;
                let known = [$(stringify!($field)),+];
                for key in table.keys() {
                    if !known.contains(&key.as_str()) {
                        return Err($crate::QuorumcastError::msg(format!(
                            "unknown config field '{}'",
                            key
                        )));
                    }
                }
                $(
                    if let Some(value) = table.get(stringify!($field)) {
                        config.$field = value.clone().try_into()?;
                    }
                )+
            }
            Ok(config)
        })()
    }};
}

#[cfg(test)]
mod tests {
    use crate::utils::QuorumcastError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        interval_ms: u64,
        name: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                interval_ms: 1000,
                name: "default".into(),
            }
        }
    }

    #[test]
    fn defaults_when_absent() -> Result<(), QuorumcastError> {
        let config = parsed_config!(None::<&str> => TestConfig;
                                    interval_ms, name)?;
        assert_eq!(config, TestConfig::default());
        Ok(())
    }

    #[test]
    fn partial_override() -> Result<(), QuorumcastError> {
        let config = parsed_config!(Some("interval_ms = 250") => TestConfig;
                                    interval_ms, name)?;
        assert_eq!(config.interval_ms, 250);
        assert_eq!(config.name, "default");
        Ok(())
    }

    #[test]
    fn unknown_field_rejected() {
        let result = parsed_config!(Some("nonexistent = 1") => TestConfig;
                                    interval_ms, name);
        assert!(result.is_err());
    }

    #[test]
    fn wrong_type_rejected() {
        let result = parsed_config!(Some("interval_ms = 'fast'") => TestConfig;
                                    interval_ms, name);
        assert!(result.is_err());
    }
}
